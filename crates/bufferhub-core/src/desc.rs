//! Buffer description: geometry, pixel format and usage

use crate::{Error, Result};
use bitflags::bitflags;

/// Supported pixel formats
///
/// Discriminants follow the hardware buffer format codes so descriptors can
/// be passed to native allocators unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PixelFormat {
    Rgba8888 = 1,
    Rgbx8888 = 2,
    Rgb888 = 3,
    Rgb565 = 4,
    RgbaFp16 = 0x16,
    Rgba1010102 = 0x2b,
    Blob = 0x21,
    R8 = 0x38,
}

impl PixelFormat {
    /// Size of one pixel in bytes (one byte per element for `Blob`)
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Blob | PixelFormat::R8 => 1,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Rgba1010102 => 4,
            PixelFormat::RgbaFp16 => 8,
        }
    }

    /// Convert from the raw format code
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(PixelFormat::Rgba8888),
            2 => Some(PixelFormat::Rgbx8888),
            3 => Some(PixelFormat::Rgb888),
            4 => Some(PixelFormat::Rgb565),
            0x16 => Some(PixelFormat::RgbaFp16),
            0x2b => Some(PixelFormat::Rgba1010102),
            0x21 => Some(PixelFormat::Blob),
            0x38 => Some(PixelFormat::R8),
            _ => None,
        }
    }
}

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsageFlags: u64 {
        const CPU_READ_RARELY = 2;
        const CPU_READ_OFTEN = 3;
        const CPU_WRITE_RARELY = 2 << 4;
        const CPU_WRITE_OFTEN = 3 << 4;
        const GPU_SAMPLED_IMAGE = 1 << 8;
        const GPU_FRAMEBUFFER = 1 << 9;
        const PROTECTED_CONTENT = 1 << 14;
        const VIDEO_ENCODE = 1 << 16;
        const SENSOR_DIRECT_DATA = 1 << 23;
        const GPU_DATA_BUFFER = 1 << 24;
    }
}

/// Static shape of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub layer_count: u32,
    pub format: PixelFormat,
    pub usage: UsageFlags,
}

impl BufferDesc {
    pub fn new(
        width: u32,
        height: u32,
        layer_count: u32,
        format: PixelFormat,
        usage: UsageFlags,
    ) -> Self {
        Self {
            width,
            height,
            layer_count,
            format,
            usage,
        }
    }

    /// Check the geometry is allocatable
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.layer_count == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "zero dimension: {}x{}x{}",
                self.width, self.height, self.layer_count
            )));
        }
        if self.format == PixelFormat::Blob && (self.height != 1 || self.layer_count != 1) {
            return Err(Error::InvalidDescriptor(
                "blob buffers must have height 1 and a single layer".to_string(),
            ));
        }
        self.byte_size().map(|_| ())
    }

    /// Number of bytes needed to back the buffer
    pub fn byte_size(&self) -> Result<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|n| n.checked_mul(self.layer_count as usize))
            .and_then(|n| n.checked_mul(self.format.bytes_per_pixel()))
            .ok_or_else(|| Error::InvalidDescriptor("buffer size overflows".to_string()))
    }
}
