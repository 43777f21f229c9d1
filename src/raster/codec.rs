//! On-disk bitmap layout for canvases and fragment payloads.
//!
//! Every file written here is a 32 bpp `BITMAPV4HEADER` bitmap with `BI_BITFIELDS` masks,
//! bottom-up rows padded to 4 bytes and pixels stored as `B, G, R, A`. The fixed header makes
//! [`pixel_byte_offset`] a pure function of the canvas size, which is what lets canvas
//! operations touch only the rows they need.
//!
//! Read responses ([`encode_image`]) use the same header and row layout as canvas files, so
//! a response for a full-canvas read is byte-identical to the canvas file itself. Clients
//! can therefore apply [`pixel_byte_offset`] to responses too. Payloads are decoded through the
//! `image` crate and may be any bitmap variant it understands.
//!
//! In-memory buffers are always straight RGBA8, top-down ([`image::RgbaImage`]).

use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::Context as _;
use image::{Rgba, RgbaImage};

use crate::foundation::{
    error::{StoreError, StoreResult},
    geom::{CanvasSize, MAX_CANVAS_HEIGHT, MAX_CANVAS_WIDTH, PixelRect},
};

pub const FILE_HEADER_LEN: usize = 14;
pub const INFO_HEADER_LEN: usize = 108;
pub const HEADER_LEN: usize = FILE_HEADER_LEN + INFO_HEADER_LEN;
pub const BITS_PER_PIXEL: u16 = 32;
pub const BYTES_PER_PIXEL: usize = 4;

/// Opaque black, the colour of a freshly created canvas and of out-of-bounds read pixels.
pub const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

const BI_BITFIELDS: u32 = 3;
const LCS_WINDOWS_COLOR_SPACE: u32 = 0x5769_6E20;
const PIXELS_PER_METER: i32 = 2835;
const RED_MASK: u32 = 0x00FF_0000;
const GREEN_MASK: u32 = 0x0000_FF00;
const BLUE_MASK: u32 = 0x0000_00FF;
const ALPHA_MASK: u32 = 0xFF00_0000;

/// Bytes per stored row, including padding to a 4-byte boundary.
pub fn row_stride(width: u32) -> u64 {
    (u64::from(BITS_PER_PIXEL) * u64::from(width)).div_ceil(32) * 4
}

pub fn pixel_data_len(size: CanvasSize) -> u64 {
    row_stride(size.width) * u64::from(size.height)
}

pub fn file_len(size: CanvasSize) -> u64 {
    HEADER_LEN as u64 + pixel_data_len(size)
}

/// Byte offset of pixel `(x, y)` (top-down canvas coordinates) inside a canvas file.
pub fn pixel_byte_offset(width: u32, height: u32, x: u32, y: u32) -> u64 {
    debug_assert!(x < width && y < height);
    let stored_row = u64::from(height - 1 - y);
    HEADER_LEN as u64 + stored_row * row_stride(width) + u64::from(x) * BYTES_PER_PIXEL as u64
}

pub fn encode_header(size: CanvasSize) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    let mut w = FieldWriter::new(&mut h);

    // BITMAPFILEHEADER
    w.bytes(b"BM");
    w.u32(file_len(size) as u32);
    w.u32(0);
    w.u32(HEADER_LEN as u32);

    // BITMAPV4HEADER
    w.u32(INFO_HEADER_LEN as u32);
    w.i32(size.width as i32);
    w.i32(size.height as i32);
    w.u16(1);
    w.u16(BITS_PER_PIXEL);
    w.u32(BI_BITFIELDS);
    w.u32(pixel_data_len(size) as u32);
    w.i32(PIXELS_PER_METER);
    w.i32(PIXELS_PER_METER);
    w.u32(0);
    w.u32(0);
    w.u32(RED_MASK);
    w.u32(GREEN_MASK);
    w.u32(BLUE_MASK);
    w.u32(ALPHA_MASK);
    w.u32(LCS_WINDOWS_COLOR_SPACE);
    // CIEXYZTRIPLE endpoints and gamma stay zero.
    h
}

/// Parse and validate a canvas header. Only the exact layout produced by
/// [`encode_header`] is accepted.
pub fn parse_header(h: &[u8]) -> StoreResult<CanvasSize> {
    if h.len() < HEADER_LEN {
        return Err(corrupt(format!("header is {} bytes", h.len())));
    }
    let r = FieldReader(h);
    if &h[0..2] != b"BM" {
        return Err(corrupt("missing BM signature"));
    }
    if r.u32(10) as usize != HEADER_LEN || r.u32(14) as usize != INFO_HEADER_LEN {
        return Err(corrupt("unexpected header size or pixel data offset"));
    }
    let width = r.i32(18);
    let height = r.i32(22);
    if !(1..=MAX_CANVAS_WIDTH as i32).contains(&width)
        || !(1..=MAX_CANVAS_HEIGHT as i32).contains(&height)
    {
        return Err(corrupt(format!("dimensions {width}x{height} out of range")));
    }
    if r.u16(26) != 1 || r.u16(28) != BITS_PER_PIXEL || r.u32(30) != BI_BITFIELDS {
        return Err(corrupt("expected one plane, 32 bpp, BI_BITFIELDS"));
    }
    if [r.u32(54), r.u32(58), r.u32(62), r.u32(66)] != [RED_MASK, GREEN_MASK, BLUE_MASK, ALPHA_MASK]
    {
        return Err(corrupt("unexpected channel masks"));
    }
    let size = CanvasSize {
        width: width as u32,
        height: height as u32,
    };
    if u64::from(r.u32(2)) != file_len(size) {
        return Err(corrupt("declared file size does not match dimensions"));
    }
    Ok(size)
}

/// Read the header of an open canvas and check the stream is long enough to hold every row.
pub fn read_header<F: Read + Seek>(file: &mut F) -> StoreResult<CanvasSize> {
    let mut h = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0)).context("seek to canvas header")?;
    file.read_exact(&mut h).context("read canvas header")?;
    let size = parse_header(&h)?;
    let actual = file.seek(SeekFrom::End(0)).context("seek to canvas end")?;
    if actual < file_len(size) {
        return Err(corrupt(format!(
            "truncated: {actual} bytes, expected {}",
            file_len(size)
        )));
    }
    Ok(size)
}

/// Write a new canvas of opaque black pixels to `path`, replacing any existing file.
pub fn write_blank_canvas(path: &Path, size: CanvasSize) -> StoreResult<()> {
    let file =
        File::create(path).with_context(|| format!("create canvas '{}'", path.display()))?;
    let mut out = BufWriter::new(file);
    out.write_all(&encode_header(size))
        .with_context(|| format!("write header of '{}'", path.display()))?;

    let mut row = vec![0u8; row_stride(size.width) as usize];
    for px in row.chunks_exact_mut(BYTES_PER_PIXEL) {
        px[3] = 0xFF;
    }
    for _ in 0..size.height {
        out.write_all(&row)
            .with_context(|| format!("write rows of '{}'", path.display()))?;
    }
    finish(out, path)
}

/// Encode a whole in-memory canvas to `path`.
pub fn write_canvas(path: &Path, pixels: &RgbaImage) -> StoreResult<()> {
    let size = CanvasSize {
        width: pixels.width(),
        height: pixels.height(),
    };
    let file =
        File::create(path).with_context(|| format!("create canvas '{}'", path.display()))?;
    let mut out = BufWriter::new(file);
    out.write_all(&encode_header(size))
        .with_context(|| format!("write header of '{}'", path.display()))?;
    encode_region(&mut out, size, size.full_rect(), pixels)?;
    finish(out, path)
}

fn finish(out: BufWriter<File>, path: &Path) -> StoreResult<()> {
    let file = out
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("flush '{}'", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync '{}'", path.display()))?;
    Ok(())
}

/// Read `out.len() / 4` pixels starting at `(x, y)` into `out` as RGBA.
pub fn read_span<F: Read + Seek>(
    file: &mut F,
    size: CanvasSize,
    x: u32,
    y: u32,
    out: &mut [u8],
) -> StoreResult<()> {
    check_span(size, x, y, out.len())?;
    file.seek(SeekFrom::Start(pixel_byte_offset(
        size.width,
        size.height,
        x,
        y,
    )))
    .context("seek to pixel span")?;
    file.read_exact(out).context("read pixel span")?;
    for px in out.chunks_exact_mut(BYTES_PER_PIXEL) {
        px.swap(0, 2);
    }
    Ok(())
}

/// Write RGBA pixels starting at `(x, y)`. Alpha is stored as opaque regardless of input.
pub fn write_span<F: Write + Seek>(
    file: &mut F,
    size: CanvasSize,
    x: u32,
    y: u32,
    rgba: &[u8],
) -> StoreResult<()> {
    check_span(size, x, y, rgba.len())?;
    let mut stored = Vec::with_capacity(rgba.len());
    for px in rgba.chunks_exact(BYTES_PER_PIXEL) {
        stored.extend_from_slice(&[px[2], px[1], px[0], 0xFF]);
    }
    file.seek(SeekFrom::Start(pixel_byte_offset(
        size.width,
        size.height,
        x,
        y,
    )))
    .context("seek to pixel span")?;
    file.write_all(&stored).context("write pixel span")?;
    Ok(())
}

pub fn read_pixel<F: Read + Seek>(
    file: &mut F,
    size: CanvasSize,
    x: u32,
    y: u32,
) -> StoreResult<Rgba<u8>> {
    let mut px = [0u8; BYTES_PER_PIXEL];
    read_span(file, size, x, y, &mut px)?;
    Ok(Rgba(px))
}

pub fn write_pixel<F: Write + Seek>(
    file: &mut F,
    size: CanvasSize,
    x: u32,
    y: u32,
    color: Rgba<u8>,
) -> StoreResult<()> {
    write_span(file, size, x, y, &color.0)
}

/// Decode the pixels of `rect` into a new top-down buffer.
pub fn decode_region<F: Read + Seek>(
    file: &mut F,
    size: CanvasSize,
    rect: PixelRect,
) -> StoreResult<RgbaImage> {
    let mut out = RgbaImage::new(rect.width, rect.height);
    let row_bytes = rect.width as usize * BYTES_PER_PIXEL;
    for (j, row) in out.chunks_exact_mut(row_bytes).enumerate() {
        read_span(file, size, rect.x, rect.y + j as u32, row)?;
    }
    Ok(out)
}

/// Store `pixels` (exactly `rect`-sized) at `rect`. Rows are written in file order.
pub fn encode_region<F: Write + Seek>(
    file: &mut F,
    size: CanvasSize,
    rect: PixelRect,
    pixels: &RgbaImage,
) -> StoreResult<()> {
    if pixels.dimensions() != (rect.width, rect.height) {
        return Err(StoreError::storage(format!(
            "region buffer is {:?}, expected {}x{}",
            pixels.dimensions(),
            rect.width,
            rect.height
        )));
    }
    let row_bytes = rect.width as usize * BYTES_PER_PIXEL;
    for j in (0..rect.height).rev() {
        let start = j as usize * row_bytes;
        write_span(
            file,
            size,
            rect.x,
            rect.y + j,
            &pixels.as_raw()[start..start + row_bytes],
        )?;
    }
    Ok(())
}

/// Encode an in-memory buffer as standalone bitmap bytes in the canvas file layout (used for
/// read responses).
pub fn encode_image(pixels: &RgbaImage) -> Vec<u8> {
    let size = CanvasSize {
        width: pixels.width(),
        height: pixels.height(),
    };
    let stride = row_stride(size.width) as usize;
    let mut out = Vec::with_capacity(file_len(size) as usize);
    out.extend_from_slice(&encode_header(size));
    let row_bytes = size.width as usize * BYTES_PER_PIXEL;
    for row in pixels.as_raw().chunks_exact(row_bytes).rev() {
        let start = out.len();
        for px in row.chunks_exact(BYTES_PER_PIXEL) {
            out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
        }
        out.resize(start + stride, 0);
    }
    out
}

/// Decode a fragment payload. Any bitmap variant the `image` crate understands is accepted.
pub fn decode_image(bytes: &[u8]) -> StoreResult<RgbaImage> {
    let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Bmp)
        .map_err(|e| StoreError::parameter(format!("payload is not a readable bitmap: {e}")))?;
    Ok(img.to_rgba8())
}

fn check_span(size: CanvasSize, x: u32, y: u32, byte_len: usize) -> StoreResult<()> {
    let n = byte_len / BYTES_PER_PIXEL;
    if byte_len % BYTES_PER_PIXEL != 0
        || y >= size.height
        || u64::from(x) + n as u64 > u64::from(size.width)
    {
        return Err(StoreError::storage(format!(
            "pixel span of {byte_len} bytes at ({x}, {y}) exceeds {}x{} canvas",
            size.width, size.height
        )));
    }
    Ok(())
}

fn corrupt(msg: impl std::fmt::Display) -> StoreError {
    StoreError::storage(format!("corrupt canvas: {msg}"))
}

struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }
}

struct FieldReader<'a>(&'a [u8]);

impl FieldReader<'_> {
    fn u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.0[at], self.0[at + 1]])
    }

    fn u32(&self, at: usize) -> u32 {
        u32::from_le_bytes([self.0[at], self.0[at + 1], self.0[at + 2], self.0[at + 3]])
    }

    fn i32(&self, at: usize) -> i32 {
        self.u32(at) as i32
    }
}
