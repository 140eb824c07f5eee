//! Keyframe decoding for the lossy VP8 bitstream (RFC 6386)
//!
//! Macroblocks are parsed and reconstructed in raster order into planes that
//! cover the whole macroblock grid. The loop filter then runs over the finished
//! planes, and the result is cropped to the frame size. Interframes are
//! rejected.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace};

use super::api::DecodingError;
use super::bit_reader::{tree_nodes, BoolReader, TreeNode};
use super::limits::Limits;
use super::loop_filter::{self, EdgeFilter};
use crate::common::prediction::{BlockPredictor, Workspace};
use crate::common::transform;
use crate::common::types::*;
use crate::slice_reader::SliceReader;

const VP8_MAGIC: [u8; 3] = [0x9d, 0x01, 0x2a];

const SEGMENT_TREE_DEFAULT: [TreeNode; 3] = tree_nodes(SEGMENT_ID_TREE, [255; 3]);

const KEYFRAME_YMODE_NODES: [TreeNode; 4] = tree_nodes(KEYFRAME_YMODE_TREE, KEYFRAME_YMODE_PROBS);

const KEYFRAME_UV_MODE_NODES: [TreeNode; 3] =
    tree_nodes(KEYFRAME_UV_MODE_TREE, KEYFRAME_UV_MODE_PROBS);

/// Subblock mode trees indexed by the modes above and to the left.
const KEYFRAME_BPRED_MODE_NODES: [[[TreeNode; 9]; 10]; 10] = {
    let mut nodes = [[[TreeNode::EMPTY; 9]; 10]; 10];
    let mut above = 0;
    while above < 10 {
        let mut left = 0;
        while left < 10 {
            let probs = KEYFRAME_BPRED_MODE_PROBS[above][left];
            nodes[above][left] = tree_nodes(KEYFRAME_BPRED_MODE_TREE, probs);
            left += 1;
        }
        above += 1;
    }
    nodes
};

/// Coefficient token tree for one band and context.
type TokenNodes = [TreeNode; NUM_DCT_TOKENS - 1];

/// Token trees indexed by [plane][coeff_position][context] instead of
/// [plane][band][context].
type TokenNodesByPosition = [[[TokenNodes; 3]; 16]; 4];

/// First node below the end-of-block branch of [`DCT_TOKEN_TREE`].
const TOKEN_NODE_AFTER_EOB: usize = 1;

/// Per-macroblock header, kept until the loop filter has run.
#[derive(Default, Clone, Copy)]
struct MacroBlock {
    luma_mode: LumaMode,
    /// Raster order; all equal to the luma mode unless that is `B`.
    subblock_modes: [IntraMode; 16],
    chroma_mode: ChromaMode,
    segment: u8,
    skip_coeffs: bool,
    /// Any coefficient, including a Y2-supplied DC, was non-zero.
    has_coeffs: bool,
}

/// What the next macroblock needs from its neighbour above or to the left:
/// the subblock modes along the shared edge, and one "had coefficients" flag
/// per block along it.
#[derive(Default, Clone, Copy)]
struct NeighbourContext {
    modes: [IntraMode; 4],
    /// Y2, four Y, two U, two V.
    nonzero: [u8; 9],
}

/// A decoded keyframe, planes cropped to the frame dimensions.
#[derive(Default, Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) width: u16,
    pub(crate) height: u16,

    /// `width * height` luma samples.
    pub(crate) y: Vec<u8>,
    /// `chroma_width() * chroma_height()` samples each.
    pub(crate) u: Vec<u8>,
    pub(crate) v: Vec<u8>,

    pub(crate) version: u8,
    pub(crate) for_display: bool,
    /// Clamping type (section 9.2); decoding always clamps.
    pub(crate) pixel_type: u8,

    pub(crate) simple_filter: bool,
    pub(crate) filter_level: u8,
    pub(crate) sharpness: u8,
}

impl Frame {
    /// Width of the chroma planes, rounded up.
    pub(crate) const fn chroma_width(&self) -> u16 {
        self.width.div_ceil(2)
    }

    /// Height of the chroma planes, rounded up.
    pub(crate) const fn chroma_height(&self) -> u16 {
        self.height.div_ceil(2)
    }
}

/// Segment map and per-segment settings (section 9.3).
struct Segmentation {
    enabled: bool,
    update_map: bool,
    segments: [Segment; MAX_SEGMENTS],
    tree: [TreeNode; 3],
}

/// Loop filter level deltas by reference frame and mode (section 9.6).
#[derive(Default)]
struct FilterDeltas {
    enabled: bool,
    reference: [i32; 4],
    mode: [i32; 4],
}

/// One plane of the macroblock grid under reconstruction.
#[derive(Default)]
struct ReconPlane {
    pixels: Vec<u8>,
    stride: usize,
    /// Macroblock size in this plane: 16 for luma, 8 for chroma.
    block: usize,
    /// Bottom row of the macroblock row above.
    top: Vec<u8>,
    /// Above-left corner, then the right column of the previous macroblock.
    left: Vec<u8>,
}

impl ReconPlane {
    fn new(mb_width: usize, mb_height: usize, block: usize) -> Self {
        Self {
            pixels: vec![0; mb_width * mb_height * block * block],
            stride: mb_width * block,
            block,
            top: vec![0; mb_width * block],
            left: vec![0; 1 + block],
        }
    }

    fn crop(&self, width: usize, height: usize) -> Vec<u8> {
        self.pixels
            .chunks_exact(self.stride)
            .take(height)
            .flat_map(|row| &row[..width])
            .copied()
            .collect()
    }

    /// Filters one macroblock: its left edge, the inner columns, its top edge,
    /// then the inner rows.
    fn filter_macroblock(&mut self, mbx: usize, mby: usize, filter: MacroblockFilter) {
        let (size, stride) = (self.block, self.stride);
        let (x, y) = (mbx * size, mby * size);
        let plane = &mut self.pixels[..];
        let inner_offsets = (4..size).step_by(4);

        if mbx > 0 {
            loop_filter::filter_vertical_edge(filter.outer, plane, stride, x, y, size);
        }
        if let Some(inner) = filter.inner {
            for dx in inner_offsets.clone() {
                loop_filter::filter_vertical_edge(inner, plane, stride, x + dx, y, size);
            }
        }
        if mby > 0 {
            loop_filter::filter_horizontal_edge(filter.outer, plane, stride, x, y, size);
        }
        if let Some(inner) = filter.inner {
            for dy in inner_offsets {
                loop_filter::filter_horizontal_edge(inner, plane, stride, x, y + dy, size);
            }
        }
    }
}

/// Loop filters for the edges of one macroblock.
#[derive(Clone, Copy)]
struct MacroblockFilter {
    /// Edges shared with the macroblocks to the left and above.
    outer: EdgeFilter,
    /// Edges between 4x4 subblocks, `None` when those are left alone.
    inner: Option<EdgeFilter>,
}

/// Reads the coefficients of one 4x4 block into `output`, dequantized and in
/// raster order. Returns whether any coefficient past `first` was coded.
///
/// After a `DCT_0` token the walk resumes below the end-of-block branch, as
/// the bitstream never codes EOB right after a zero.
#[inline]
fn read_coefficients(
    reader: &mut BoolReader<'_>,
    output: &mut [i32; 16],
    nodes: &[[TokenNodes; 3]; 16],
    first: usize,
    complexity: usize,
    dcq: i16,
    acq: i16,
) -> Result<bool, DecodingError> {
    debug_assert!(complexity <= 2);

    let mut n = first;
    let mut ctx = complexity;
    let mut start = 0;

    while n < 16 {
        let token = reader.read_with_tree_from(&nodes[n][ctx], start);
        let magnitude = match token {
            DCT_EOB => break,
            DCT_0 => {
                n += 1;
                ctx = 0;
                start = TOKEN_NODE_AFTER_EOB;
                continue;
            }
            DCT_1..=DCT_4 => i32::from(token),
            _ => {
                let cat = (token - DCT_CAT1) as usize;
                let mut extra = 0i32;
                for &p in PROB_DCT_CAT[cat].iter().take_while(|&&p| p != 0) {
                    extra = extra + extra + reader.get_bit(p);
                }
                DCT_CAT_BASE[cat] + extra
            }
        };

        let value = if reader.read_flag() {
            -magnitude
        } else {
            magnitude
        };

        let zigzag = usize::from(ZIGZAG[n]);
        let q = if zigzag > 0 { acq } else { dcq };
        output[zigzag] = value * i32::from(q);

        ctx = if magnitude == 1 { 1 } else { 2 };
        start = 0;
        n += 1;
    }

    reader.check(n > first)
}

fn short_header(_: DecodingError) -> DecodingError {
    DecodingError::NotEnoughInitData
}

/// Decoder for a single VP8 keyframe.
pub(crate) struct Vp8Decoder<'a> {
    data: SliceReader<'a>,
    /// First partition: frame header, then per-macroblock modes.
    header: BoolReader<'a>,
    /// Token partitions; macroblock row `y` reads from partition `y % len`.
    partitions: Vec<BoolReader<'a>>,
    limits: &'a Limits,

    frame: Frame,
    mb_width: usize,
    mb_height: usize,
    macroblocks: Vec<MacroBlock>,

    segmentation: Segmentation,
    filter_deltas: FilterDeltas,
    token_probs: Box<TokenProbTables>,
    token_nodes: Box<TokenNodesByPosition>,
    /// Probability that a macroblock has coefficients; `None` when none skip.
    skip_prob: Option<Prob>,

    above: Vec<NeighbourContext>,
    left: NeighbourContext,

    /// Y, U and V.
    planes: [ReconPlane; 3],
    /// Coefficients of the current macroblock: 16 Y, 4 U, 4 V blocks.
    /// Reconstruction zeroes each block after use.
    coeffs: [[i32; 16]; 24],
}

impl<'a> Vp8Decoder<'a> {
    pub(crate) fn new(data: &'a [u8], limits: &'a Limits) -> Self {
        Self {
            data: SliceReader::new(data),
            header: BoolReader::new(&[]),
            partitions: Vec::new(),
            limits,

            frame: Frame::default(),
            mb_width: 0,
            mb_height: 0,
            macroblocks: Vec::new(),

            segmentation: Segmentation {
                enabled: false,
                update_map: false,
                segments: [Segment::default(); MAX_SEGMENTS],
                tree: SEGMENT_TREE_DEFAULT,
            },
            filter_deltas: FilterDeltas::default(),
            token_probs: Box::new(COEFF_PROBS),
            token_nodes: Box::new([[[[TreeNode::EMPTY; NUM_DCT_TOKENS - 1]; 3]; 16]; 4]),
            skip_prob: None,

            above: Vec::new(),
            left: NeighbourContext::default(),

            planes: Default::default(),
            coeffs: [[0; 16]; 24],
        }
    }

    /// Decodes a keyframe, checking its dimensions against `limits` before allocating.
    pub(crate) fn decode_frame(data: &'a [u8], limits: &'a Limits) -> Result<Frame, DecodingError> {
        Self::new(data, limits).decode()
    }

    /// Parses the uncompressed data chunk: frame tag, start code and dimensions.
    /// Returns the length of the first partition.
    fn read_frame_tag(&mut self) -> Result<usize, DecodingError> {
        let tag = self.data.read_u24_le().map_err(short_header)?;
        if tag & 1 != 0 {
            return Err(DecodingError::UnsupportedFeature("Non-keyframe frames".into()));
        }
        let version = ((tag >> 1) & 7) as u8;
        if version > 3 {
            return Err(DecodingError::UnsupportedFeature(format!("VP8 version {version}")));
        }
        self.frame.version = version;
        self.frame.for_display = tag & 0x10 != 0;

        let mut magic = [0u8; 3];
        self.data.read_exact(&mut magic).map_err(short_header)?;
        if magic != VP8_MAGIC {
            return Err(DecodingError::Vp8MagicInvalid(magic));
        }

        // the top two bits of each dimension are an upscaling hint, ignored
        let width = self.data.read_u16_le().map_err(short_header)? & 0x3fff;
        let height = self.data.read_u16_le().map_err(short_header)? & 0x3fff;
        if width == 0 || height == 0 {
            return Err(DecodingError::ZeroDimensions);
        }
        self.frame.width = width;
        self.frame.height = height;

        Ok((tag >> 5) as usize)
    }

    /// Checks the frame against the limits, then sizes every buffer for it.
    fn allocate(&mut self) -> Result<(), DecodingError> {
        let (width, height) = (self.frame.width, self.frame.height);
        self.limits
            .check_dimensions(u32::from(width), u32::from(height))?;

        self.mb_width = usize::from(width.div_ceil(16));
        self.mb_height = usize::from(height.div_ceil(16));
        let grid = self.mb_width * self.mb_height;
        let cropped = usize::from(width) * usize::from(height)
            + 2 * usize::from(self.frame.chroma_width()) * usize::from(self.frame.chroma_height());
        // 256 luma and 2 * 64 chroma samples per macroblock, plus the cropped copy
        self.limits.check_memory(grid * 384 + cropped)?;

        debug!(
            "VP8 keyframe {}x{} in {}x{} macroblocks, version {}, shown {}",
            width,
            height,
            self.mb_width,
            self.mb_height,
            self.frame.version,
            self.frame.for_display
        );

        let (mbw, mbh) = (self.mb_width, self.mb_height);
        self.planes = [
            ReconPlane::new(mbw, mbh, 16),
            ReconPlane::new(mbw, mbh, 8),
            ReconPlane::new(mbw, mbh, 8),
        ];
        self.above = vec![NeighbourContext::default(); mbw];
        self.macroblocks = Vec::with_capacity(grid);
        Ok(())
    }

    fn read_frame_header(&mut self) -> Result<(), DecodingError> {
        let first_partition_len = self.read_frame_tag()?;
        self.allocate()?;
        let first_partition = self
            .data
            .take_slice(first_partition_len)
            .map_err(short_header)?;
        self.header = BoolReader::new(first_partition);

        let color_space = self.header.read_literal(1);
        self.frame.pixel_type = self.header.read_literal(1);
        if color_space != 0 {
            return Err(DecodingError::ColorSpaceInvalid(color_space));
        }

        self.segmentation.enabled = self.header.read_flag();
        if self.segmentation.enabled {
            self.read_segmentation()?;
        }

        self.frame.simple_filter = self.header.read_flag();
        self.frame.filter_level = self.header.read_literal(6);
        self.frame.sharpness = self.header.read_literal(3);
        self.filter_deltas.enabled = self.header.read_flag();
        if self.filter_deltas.enabled {
            self.read_filter_deltas()?;
        }

        let partition_count = 1usize << self.header.read_literal(2);
        self.header.check(())?;

        debug!(
            "VP8 {} filter at level {} sharpness {}, {} token partition(s), segmentation {}, clamping type {}",
            if self.frame.simple_filter {
                "simple"
            } else {
                "normal"
            },
            self.frame.filter_level,
            self.frame.sharpness,
            partition_count,
            self.segmentation.enabled,
            self.frame.pixel_type,
        );

        self.read_partitions(partition_count)?;
        self.read_quantizers()?;

        // refresh_entropy_probs; there is no later frame to keep them for
        let _ = self.header.read_flag();

        self.read_token_prob_updates()?;
        self.build_token_nodes();

        self.skip_prob = if self.header.read_flag() {
            Some(self.header.read_literal(8))
        } else {
            None
        };
        self.header.check(())
    }

    fn read_segmentation(&mut self) -> Result<(), DecodingError> {
        let r = &mut self.header;
        let seg = &mut self.segmentation;

        seg.update_map = r.read_flag();
        if r.read_flag() {
            let absolute = r.read_flag();
            for segment in &mut seg.segments {
                segment.delta_values = !absolute;
            }
            for segment in &mut seg.segments {
                segment.quantizer_level = r.read_optional_signed_value(7) as i8;
            }
            for segment in &mut seg.segments {
                segment.loopfilter_level = r.read_optional_signed_value(6) as i8;
            }
        }

        if seg.update_map {
            for node in &mut seg.tree {
                node.prob = if r.read_flag() { r.read_literal(8) } else { 255 };
            }
        }
        r.check(())
    }

    fn read_filter_deltas(&mut self) -> Result<(), DecodingError> {
        let r = &mut self.header;
        let deltas = &mut self.filter_deltas;
        if r.read_flag() {
            for delta in deltas.reference.iter_mut().chain(&mut deltas.mode) {
                *delta = r.read_optional_signed_value(6);
            }
        }
        r.check(())
    }

    /// Splits the data after the first partition into `count` token partitions.
    fn read_partitions(&mut self, count: usize) -> Result<(), DecodingError> {
        // 3 byte sizes for all but the last partition, which takes the rest
        let mut sizes = Vec::with_capacity(count - 1);
        for _ in 1..count {
            sizes.push(self.data.read_u24_le().map_err(short_header)? as usize);
        }

        self.partitions = Vec::with_capacity(count);
        for size in sizes {
            let data = self.data.take_slice(size).map_err(short_header)?;
            self.partitions.push(BoolReader::new(data));
        }
        self.partitions
            .push(BoolReader::new(self.data.remaining_slice()));
        Ok(())
    }

    /// Reads the quantizer indices and derives every segment's step sizes.
    fn read_quantizers(&mut self) -> Result<(), DecodingError> {
        let r = &mut self.header;
        let base = i32::from(r.read_literal(7));
        let ydc_delta = r.read_optional_signed_value(4);
        let y2dc_delta = r.read_optional_signed_value(4);
        let y2ac_delta = r.read_optional_signed_value(4);
        let uvdc_delta = r.read_optional_signed_value(4);
        let uvac_delta = r.read_optional_signed_value(4);

        let enabled = self.segmentation.enabled;
        let count = if enabled { MAX_SEGMENTS } else { 1 };
        for segment in &mut self.segmentation.segments[..count] {
            let level = i32::from(segment.quantizer_level);
            let index = match (enabled, segment.delta_values) {
                (false, _) => base,
                (true, true) => base + level,
                (true, false) => level,
            };
            let dc = |delta: i32| DC_QUANT[(index + delta).clamp(0, 127) as usize];
            let ac = |delta: i32| AC_QUANT[(index + delta).clamp(0, 127) as usize];

            segment.ydc = dc(ydc_delta);
            segment.yac = ac(0);
            segment.y2dc = dc(y2dc_delta) * 2;
            // widened: 155% of the largest step leaves the i16 range
            segment.y2ac = ((i32::from(ac(y2ac_delta)) * 155 / 100) as i16).max(8);
            segment.uvdc = dc(uvdc_delta).min(132);
            segment.uvac = ac(uvac_delta);
        }
        r.check(())
    }

    fn read_token_prob_updates(&mut self) -> Result<(), DecodingError> {
        let r = &mut self.header;
        let probs = self.token_probs.iter_mut().flatten().flatten().flatten();
        let update_probs = COEFF_UPDATE_PROBS.iter().flatten().flatten().flatten();
        for (prob, &update_prob) in probs.zip(update_probs) {
            if r.read_bool(update_prob) {
                *prob = r.read_literal(8);
            }
        }
        r.check(())
    }

    /// Builds the token trees of every coefficient position from the current
    /// band probabilities.
    fn build_token_nodes(&mut self) {
        for (plane_nodes, plane_probs) in self.token_nodes.iter_mut().zip(&*self.token_probs) {
            for (position_nodes, &band) in plane_nodes.iter_mut().zip(&COEFF_BANDS) {
                let band_probs = &plane_probs[usize::from(band)];
                for (nodes, &probs) in position_nodes.iter_mut().zip(band_probs) {
                    *nodes = tree_nodes(DCT_TOKEN_TREE, probs);
                }
            }
        }
    }

    fn read_macroblock_header(&mut self, mbx: usize) -> Result<MacroBlock, DecodingError> {
        let r = &mut self.header;
        let above = &mut self.above[mbx];
        let left = &mut self.left;
        let mut mb = MacroBlock::default();

        if self.segmentation.enabled && self.segmentation.update_map {
            mb.segment = r.read_with_tree(&self.segmentation.tree) as u8;
        }
        mb.skip_coeffs = self.skip_prob.is_some_and(|prob| r.read_bool(prob));

        let luma = r.read_with_tree(&KEYFRAME_YMODE_NODES);
        mb.luma_mode =
            LumaMode::from_i8(luma).ok_or(DecodingError::LumaPredictionModeInvalid(luma))?;

        match mb.luma_mode.into_intra() {
            Some(mode) => {
                mb.subblock_modes = [mode; 16];
                above.modes = [mode; 4];
                left.modes = [mode; 4];
            }
            // B: each subblock's mode is coded in the context of its neighbours
            None => {
                for (i, slot) in mb.subblock_modes.iter_mut().enumerate() {
                    let (x, y) = (i % 4, i / 4);
                    let nodes =
                        &KEYFRAME_BPRED_MODE_NODES[above.modes[x] as usize][left.modes[y] as usize];
                    let raw = r.read_with_tree(nodes);
                    let mode = IntraMode::from_i8(raw)
                        .ok_or(DecodingError::IntraPredictionModeInvalid(raw))?;
                    *slot = mode;
                    above.modes[x] = mode;
                    left.modes[y] = mode;
                }
            }
        }

        let chroma = r.read_with_tree(&KEYFRAME_UV_MODE_NODES);
        mb.chroma_mode = ChromaMode::from_i8(chroma)
            .ok_or(DecodingError::ChromaPredictionModeInvalid(chroma))?;

        r.check(mb)
    }

    /// Reads every coefficient block of a macroblock into `self.coeffs`.
    /// The inverse transforms run later, during reconstruction.
    fn read_residuals(
        &mut self,
        mb: &mut MacroBlock,
        mbx: usize,
        partition: usize,
    ) -> Result<(), DecodingError> {
        let q = self.segmentation.segments[usize::from(mb.segment)];
        let reader = &mut self.partitions[partition];
        let nodes = &*self.token_nodes;
        let coeffs = &mut self.coeffs;
        let above = &mut self.above[mbx].nonzero;
        let left = &mut self.left.nonzero;

        // the Y2 block, when present, supplies the DC of all 16 Y blocks
        let y_plane = if mb.luma_mode == LumaMode::B {
            Plane::YCoeff0
        } else {
            let mut y2 = [0i32; 16];
            let ctx = usize::from(above[0] + left[0]);
            let y2_nodes = &nodes[Plane::Y2 as usize];
            let coded = read_coefficients(reader, &mut y2, y2_nodes, 0, ctx, q.y2dc, q.y2ac)?;
            above[0] = u8::from(coded);
            left[0] = u8::from(coded);

            transform::iwht4x4(&mut y2);
            for (block, dc) in coeffs.iter_mut().zip(y2) {
                block[0] = dc;
            }
            Plane::YCoeff1
        };
        let first = usize::from(y_plane == Plane::YCoeff1);

        for (i, block) in coeffs[..16].iter_mut().enumerate() {
            let (x, y) = (1 + i % 4, 1 + i / 4);
            let ctx = usize::from(above[x] + left[y]);
            let y_nodes = &nodes[y_plane as usize];
            let coded = read_coefficients(reader, block, y_nodes, first, ctx, q.ydc, q.yac)?;
            mb.has_coeffs |= coded || block[0] != 0;
            above[x] = u8::from(coded);
            left[y] = u8::from(coded);
        }

        // U blocks, then V blocks, each 2x2 in raster order
        for (i, block) in coeffs[16..].iter_mut().enumerate() {
            let base = if i < 4 { 5 } else { 7 };
            let (x, y) = (base + i % 2, base + i / 2 % 2);
            let ctx = usize::from(above[x] + left[y]);
            let uv_nodes = &nodes[Plane::Chroma as usize];
            let coded = read_coefficients(reader, block, uv_nodes, 0, ctx, q.uvdc, q.uvac)?;
            mb.has_coeffs |= coded || block[0] != 0;
            above[x] = u8::from(coded);
            left[y] = u8::from(coded);
        }

        Ok(())
    }

    fn reconstruct_luma(&mut self, mbx: usize, mby: usize, mb: &MacroBlock) {
        let plane = &mut self.planes[0];
        let mut ws = Workspace::luma(mbx, mby, self.mb_width, &plane.top, &plane.left);

        let whole_block = match mb.luma_mode {
            LumaMode::DC => Some(BlockPredictor::Dc),
            LumaMode::V => Some(BlockPredictor::Vertical),
            LumaMode::H => Some(BlockPredictor::Horizontal),
            LumaMode::TM => Some(BlockPredictor::TrueMotion),
            LumaMode::B => None,
        };
        if let Some(predictor) = whole_block {
            ws.predict(predictor);
        }

        for (i, coeffs) in self.coeffs[..16].iter_mut().enumerate() {
            let (sbx, sby) = (i % 4, i / 4);
            // subblocks predict from their already reconstructed neighbours
            if whole_block.is_none() {
                ws.predict_subblock(sbx, sby, mb.subblock_modes[i]);
            }
            ws.add_residual(sbx * 4, sby * 4, coeffs);
        }

        ws.store_edges(mbx, &mut plane.top, &mut plane.left);
        ws.write_to(&mut plane.pixels, plane.stride, mbx, mby);
    }

    fn reconstruct_chroma(&mut self, mbx: usize, mby: usize, mb: &MacroBlock) {
        let predictor = match mb.chroma_mode {
            ChromaMode::DC => BlockPredictor::Dc,
            ChromaMode::V => BlockPredictor::Vertical,
            ChromaMode::H => BlockPredictor::Horizontal,
            ChromaMode::TM => BlockPredictor::TrueMotion,
        };
        let blocks = self.coeffs[16..].chunks_exact_mut(4);
        for (plane, coeffs) in self.planes[1..].iter_mut().zip(blocks) {
            let mut ws = Workspace::chroma(mbx, mby, &plane.top, &plane.left);
            ws.predict(predictor);
            for (i, block) in coeffs.iter_mut().enumerate() {
                ws.add_residual(i % 2 * 4, i / 2 * 4, block);
            }
            ws.store_edges(mbx, &mut plane.top, &mut plane.left);
            ws.write_to(&mut plane.pixels, plane.stride, mbx, mby);
        }
    }

    /// Edge filters for one macroblock, or `None` when its filter level comes out as zero.
    fn macroblock_filter(&self, mb: &MacroBlock) -> Option<MacroblockFilter> {
        let mut level = i32::from(self.frame.filter_level);
        if self.segmentation.enabled {
            let segment = &self.segmentation.segments[usize::from(mb.segment)];
            let segment_level = i32::from(segment.loopfilter_level);
            level = if segment.delta_values {
                level + segment_level
            } else {
                segment_level
            };
        }
        level = level.clamp(0, 63);
        if self.filter_deltas.enabled {
            // keyframes only use the intra reference delta
            level += self.filter_deltas.reference[0];
            if mb.luma_mode == LumaMode::B {
                level += self.filter_deltas.mode[0];
            }
        }
        let level = level.clamp(0, 63) as u8;
        if level == 0 {
            return None;
        }

        let sharpness = self.frame.sharpness;
        let interior_limit = match sharpness {
            0 => level,
            1..=4 => (level >> 1).min(9 - sharpness),
            _ => (level >> 2).min(9 - sharpness),
        }
        .max(1);
        let hev_threshold = match level {
            40.. => 2,
            15..=39 => 1,
            _ => 0,
        };
        let outer_limit = (level + 2) * 2 + interior_limit;
        let inner_limit = level * 2 + interior_limit;

        let (outer, inner) = if self.frame.simple_filter {
            (
                EdgeFilter::Simple {
                    edge_limit: outer_limit,
                },
                EdgeFilter::Simple {
                    edge_limit: inner_limit,
                },
            )
        } else {
            (
                EdgeFilter::Macroblock {
                    hev_threshold,
                    interior_limit,
                    edge_limit: outer_limit,
                },
                EdgeFilter::Subblock {
                    hev_threshold,
                    interior_limit,
                    edge_limit: inner_limit,
                },
            )
        };
        let has_inner_edges = mb.luma_mode == LumaMode::B || (!mb.skip_coeffs && mb.has_coeffs);
        Some(MacroblockFilter {
            outer,
            inner: has_inner_edges.then_some(inner),
        })
    }

    /// Runs the loop filter over the reconstructed frame in macroblock raster
    /// order. The simple filter leaves chroma untouched.
    fn filter_frame(&mut self) {
        if self.frame.filter_level == 0 {
            return;
        }

        let filtered_planes = if self.frame.simple_filter { 1 } else { 3 };
        for (i, mb) in self.macroblocks.iter().enumerate() {
            let Some(filter) = self.macroblock_filter(mb) else {
                continue;
            };
            let (mbx, mby) = (i % self.mb_width, i / self.mb_width);
            for plane in &mut self.planes[..filtered_planes] {
                plane.filter_macroblock(mbx, mby, filter);
            }
        }
    }

    fn decode(mut self) -> Result<Frame, DecodingError> {
        self.read_frame_header()?;

        for mby in 0..self.mb_height {
            let partition = mby % self.partitions.len();
            self.left = NeighbourContext::default();

            for mbx in 0..self.mb_width {
                let mut mb = self.read_macroblock_header(mbx)?;

                if mb.skip_coeffs {
                    // nothing coded: clear the flags, except Y2's when this mode has none
                    let first = usize::from(mb.luma_mode == LumaMode::B);
                    self.above[mbx].nonzero[first..].fill(0);
                    self.left.nonzero[first..].fill(0);
                } else {
                    self.read_residuals(&mut mb, mbx, partition)?;
                }

                self.reconstruct_luma(mbx, mby, &mb);
                self.reconstruct_chroma(mbx, mby, &mb);
                self.macroblocks.push(mb);
            }

            trace!("VP8 macroblock row {mby} reconstructed");
        }

        self.filter_frame();

        let width = usize::from(self.frame.width);
        let height = usize::from(self.frame.height);
        let chroma_width = usize::from(self.frame.chroma_width());
        let chroma_height = usize::from(self.frame.chroma_height());
        let [y, u, v] = &self.planes;
        self.frame.y = y.crop(width, height);
        self.frame.u = u.crop(chroma_width, chroma_height);
        self.frame.v = v.crop(chroma_width, chroma_height);
        Ok(self.frame)
    }
}
