use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code describing a pixel/stream format.
///
/// # Example
/// ```rust
/// use charon_core::format::FourCc;
///
/// let fcc = FourCc::new(*b"NV12");
/// assert_eq!(fcc.to_string(), "NV12");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

/// Resolution of a frame.
///
/// # Example
/// ```rust
/// use charon_core::format::Resolution;
///
/// let res = Resolution::new(1920, 1080).unwrap();
/// assert_eq!(res.width.get(), 1920);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }
}

/// Role a stream plays inside a channel.
///
/// The type drives policy decisions up the stack: deferred buffer
/// allocation for latency-insensitive streams, and the caller's choice of
/// bundle eviction tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamType {
    Preview,
    Postview,
    Snapshot,
    Video,
    Metadata,
    Raw,
}

impl StreamType {
    /// Streams whose buffers may be allocated off the start path to keep
    /// start-of-preview latency low.
    pub fn defers_allocation(self) -> bool {
        matches!(
            self,
            StreamType::Snapshot | StreamType::Metadata | StreamType::Raw
        )
    }
}

/// Stream format including code and geometry.
///
/// # Example
/// ```rust
/// use charon_core::format::{FourCc, Resolution, StreamFormat};
///
/// let fmt = StreamFormat::new(FourCc::new(*b"NV12"), Resolution::new(640, 480).unwrap());
/// assert_eq!(fmt.code.to_string(), "NV12");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamFormat {
    /// FourCc code describing pixel layout.
    pub code: FourCc,
    /// Resolution of the frame.
    pub resolution: Resolution,
}

impl StreamFormat {
    /// Build a new format.
    pub fn new(code: FourCc, resolution: Resolution) -> Self {
        Self { code, resolution }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for FourCc {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Prefer string encoding so decoding does not rely on `deserialize_any`.
        let encoded = self.as_str().unwrap_or("FFFF");
        serializer.serialize_str(encoded)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FourCc {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct FourCcVisitor;

        impl<'de> serde::de::Visitor<'de> for FourCcVisitor {
            type Value = FourCc;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 4-character FourCc string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                FourCc::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(FourCcVisitor)
    }
}
