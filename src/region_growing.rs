//! Region growing by segment means.
//!
//! Every valid pixel starts as its own segment. Neighbouring segments are merged when they are
//! each other's most similar neighbour and the Euclidean distance of their mean feature vectors
//! is under the current threshold. The threshold climbs from 0 to `similarity_threshold` in
//! `similarity_increase_steps` steps; segments still smaller than `min_segment_size` are then
//! merged into their closest neighbour regardless of distance.
//!
//! The segment graph and the merge passes are shared with the Baatz strategy, which plugs its own
//! [`SegmentMerger`] in.

use crate::block::SegmentsBlock;
use crate::connectivity::DisjointSet;
use crate::error::SegmenterError;
use crate::ids::SegmentIdAllocator;
use crate::progress::ProgressReporter;
use crate::strategy::{BlockWindow, LabelWindow, SegmentationStrategy, StrategyParameters};
use log::trace;
use multiversion::multiversion;

const NO_SEGMENT: u32 = u32::MAX;

#[multiversion(targets = "simd")]
pub(crate) fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0f64;
    for (x, y) in a.iter().zip(b) {
        let d = x - y;
        sum += d * d;
    }
    sum.sqrt()
}

/// Segment features and merge cost of one region growing flavour.
pub(crate) trait SegmentMerger {
    /// Feature values stored per segment.
    fn features_len(&self, bands: usize) -> usize;

    /// Features of a one pixel segment from its normalized band values.
    fn init_features(&self, pixel: &[f64], out: &mut [f64]);

    /// Called before every merge iteration.
    fn update(&mut self, _graph: &SegmentGraph) {}

    /// Cost of merging `a` and `b`, which share `border` pixel edges. The features of the merged
    /// segment are written to `merged`.
    fn dissimilarity(
        &self,
        graph: &SegmentGraph,
        a: u32,
        b: u32,
        border: u32,
        merged: &mut [f64],
    ) -> f64;
}

/// Bounding box of a segment in window pixels, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl SegmentBox {
    fn pixel(x: usize, y: usize) -> Self {
        Self {
            x0: x as u32,
            y0: y as u32,
            x1: x as u32 + 1,
            y1: y as u32 + 1,
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    segment: u32,
    /// Pixel edges shared with `segment`.
    border: u32,
}

/// How a merge pass picks pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PassRules {
    /// Only merge when each segment is the other's cheapest neighbour.
    pub mutual_best: bool,
    /// Let a segment merged in this iteration merge again before the next one.
    pub same_iteration: bool,
}

/// Adjacency graph of the live segments of one block.
///
/// Segment data lives at the union-find root, which is the smallest merged segment id.
pub(crate) struct SegmentGraph {
    features_len: usize,
    features: Vec<f64>,
    sizes: Vec<u32>,
    boxes: Vec<SegmentBox>,
    neighbours: Vec<Vec<Edge>>,
    alive: Vec<bool>,
    merged_in: Vec<u32>,
    iteration: u32,
    set: DisjointSet,
}

impl SegmentGraph {
    /// One segment per active pixel; `pixel_segment` maps pixels to their initial segment.
    pub fn from_window<M: SegmentMerger>(
        input: &BlockWindow,
        mask: &[bool],
        merger: &M,
        pixel_segment: &mut [u32],
    ) -> Self {
        let width = input.width();
        let mut segments = 0u32;
        for (seg, active) in pixel_segment.iter_mut().zip(mask) {
            *seg = if *active {
                segments += 1;
                segments - 1
            } else {
                NO_SEGMENT
            };
        }

        let features_len = merger.features_len(input.band_count());
        let mut features = vec![0f64; segments as usize * features_len];
        let mut boxes = Vec::with_capacity(segments as usize);
        let mut neighbours = vec![Vec::with_capacity(4); segments as usize];
        let mut pixel = vec![0f64; input.band_count()];
        for (index, &seg) in pixel_segment.iter().enumerate() {
            if seg == NO_SEGMENT {
                continue;
            }
            let s = seg as usize;
            input.features(index, &mut pixel);
            merger.init_features(&pixel, &mut features[s * features_len..(s + 1) * features_len]);
            let col = index % width;
            boxes.push(SegmentBox::pixel(col, index / width));
            if col > 0 && pixel_segment[index - 1] != NO_SEGMENT {
                let left = pixel_segment[index - 1];
                neighbours[s].push(Edge {
                    segment: left,
                    border: 1,
                });
                neighbours[left as usize].push(Edge {
                    segment: seg,
                    border: 1,
                });
            }
            if index >= width && pixel_segment[index - width] != NO_SEGMENT {
                let up = pixel_segment[index - width];
                neighbours[s].push(Edge {
                    segment: up,
                    border: 1,
                });
                neighbours[up as usize].push(Edge {
                    segment: seg,
                    border: 1,
                });
            }
        }

        Self {
            features_len,
            features,
            sizes: vec![1; segments as usize],
            boxes,
            neighbours,
            alive: vec![true; segments as usize],
            merged_in: vec![0; segments as usize],
            iteration: 0,
            set: DisjointSet::new(segments),
        }
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn features(&self, seg: u32) -> &[f64] {
        let s = seg as usize;
        &self.features[s * self.features_len..(s + 1) * self.features_len]
    }

    pub fn size(&self, seg: u32) -> u32 {
        self.sizes[seg as usize]
    }

    pub fn bounding_box(&self, seg: u32) -> SegmentBox {
        self.boxes[seg as usize]
    }

    /// Ids of the live segments.
    pub fn live(&self) -> impl Iterator<Item = u32> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, alive)| **alive)
            .map(|(seg, _)| seg as u32)
    }

    /// Cheapest neighbour as `(neighbour, cost, shared border)`, ties to the lowest id.
    fn best_neighbour<M: SegmentMerger>(
        &self,
        merger: &M,
        seg: u32,
        scratch: &mut [f64],
    ) -> Option<(u32, f64, u32)> {
        let mut best: Option<(u32, f64, u32)> = None;
        for edge in &self.neighbours[seg as usize] {
            let n = edge.segment;
            let d = merger.dissimilarity(self, seg, n, edge.border, scratch);
            match best {
                Some((b, bd, _)) if bd < d || (bd == d && b < n) => {}
                _ => best = Some((n, d, edge.border)),
            }
        }
        best
    }

    /// Merge two live segments into the lower id, which takes the `merged` features.
    fn merge(&mut self, a: u32, b: u32, merged: &[f64]) {
        let (keep, gone) = if a < b { (a, b) } else { (b, a) };
        let (k, g) = (keep as usize, gone as usize);
        let len = self.features_len;
        self.features[k * len..(k + 1) * len].copy_from_slice(merged);
        self.sizes[k] += self.sizes[g];
        self.boxes[k] = self.boxes[k].union(&self.boxes[g]);
        self.alive[g] = false;
        self.merged_in[k] = self.iteration;
        self.set.merge(keep, gone);

        let gone_edges = std::mem::take(&mut self.neighbours[g]);
        self.neighbours[k].retain(|e| e.segment != gone);
        for edge in gone_edges {
            if edge.segment == keep {
                continue;
            }
            let list = &mut self.neighbours[edge.segment as usize];
            list.retain(|e| e.segment != gone);
            match list.iter_mut().find(|e| e.segment == keep) {
                Some(e) => e.border += edge.border,
                None => list.push(Edge {
                    segment: keep,
                    border: edge.border,
                }),
            }
            match self.neighbours[k].iter_mut().find(|e| e.segment == edge.segment) {
                Some(e) => e.border += edge.border,
                None => self.neighbours[k].push(edge),
            }
        }
    }

    /// Merge segments with their cheapest neighbour while the cost stays under `threshold`,
    /// iterating until nothing changes. With `max_size` only segments smaller than it start a
    /// merge. Returns the number of merges.
    pub fn merge_pass<M: SegmentMerger>(
        &mut self,
        merger: &mut M,
        threshold: f64,
        max_size: Option<usize>,
        rules: PassRules,
    ) -> usize {
        let mut total = 0;
        let mut scratch = vec![0f64; self.features_len];
        loop {
            self.iteration = self.iteration.wrapping_add(1);
            merger.update(self);
            let mut merges = 0;
            for seg in 0..self.len() as u32 {
                let s = seg as usize;
                if !self.alive[s] || (!rules.same_iteration && self.merged_in[s] == self.iteration)
                {
                    continue;
                }
                if max_size.is_some_and(|max| self.sizes[s] as usize >= max) {
                    continue;
                }
                let Some((best, cost, border)) = self.best_neighbour(merger, seg, &mut scratch)
                else {
                    continue;
                };
                if cost > threshold {
                    continue;
                }
                if !rules.same_iteration && self.merged_in[best as usize] == self.iteration {
                    continue;
                }
                if rules.mutual_best
                    && !matches!(
                        self.best_neighbour(merger, best, &mut scratch),
                        Some((back, _, _)) if back == seg
                    )
                {
                    continue;
                }
                merger.dissimilarity(self, seg, best, border, &mut scratch);
                self.merge(seg, best, &scratch);
                merges += 1;
            }
            total += merges;
            if merges == 0 {
                return total;
            }
        }
    }
}

fn step(progress: Option<&dyn ProgressReporter>) -> Result<(), SegmenterError> {
    if let Some(progress) = progress {
        if !progress.is_active() {
            return Err(SegmenterError::Cancelled);
        }
        progress.pulse();
    }
    Ok(())
}

/// Shared driver of the region growing strategies: an exact pass at cost 0, the stepped passes up
/// to `similarity_threshold`, forced merging of small segments and label assignment.
#[allow(clippy::too_many_arguments)]
pub(crate) fn grow<M: SegmentMerger>(
    merger: &mut M,
    params: &StrategyParameters,
    first: PassRules,
    stepped: PassRules,
    ids: &SegmentIdAllocator,
    block: &SegmentsBlock,
    input: &BlockWindow,
    output: &mut LabelWindow,
    progress: Option<&dyn ProgressReporter>,
) -> Result<(), SegmenterError> {
    let steps = params.similarity_increase_steps;
    if let Some(progress) = progress {
        progress.set_total_steps(2 + steps);
    }

    let mask = input.valid_mask();
    let mut pixel_segment = vec![NO_SEGMENT; mask.len()];
    let mut graph = SegmentGraph::from_window(input, &mask.data, merger, &mut pixel_segment);

    let mut merges = graph.merge_pass(merger, 0.0, None, first);
    step(progress)?;
    for s in 1..=steps {
        let threshold = s as f64 * params.similarity_threshold / steps as f64;
        merges += graph.merge_pass(merger, threshold, None, stepped);
        step(progress)?;
    }
    if params.min_segment_size > 1 {
        let forced = PassRules {
            mutual_best: false,
            same_iteration: true,
        };
        merges += graph.merge_pass(merger, f64::INFINITY, Some(params.min_segment_size), forced);
    }
    step(progress)?;

    let live = graph.live().count();
    trace!(
        "block ({}, {}): {} segments after {merges} merges",
        block.matrix_row,
        block.matrix_col,
        live
    );
    if live == 0 {
        return Ok(());
    }
    let mut labels = vec![0u32; graph.len()];
    let first_label = ids.next_ids(live as u32)?;
    for (seg, label) in graph.live().zip(first_label..) {
        labels[seg as usize] = label;
    }
    for (out, &seg) in output.data.iter_mut().zip(&pixel_segment) {
        if seg != NO_SEGMENT {
            *out = labels[graph.set.find(seg) as usize];
        }
    }
    Ok(())
}

/// Segment means; the cost of a merge is the distance of the two means.
struct MeanMerger {
    bands: usize,
}

impl SegmentMerger for MeanMerger {
    fn features_len(&self, bands: usize) -> usize {
        bands
    }

    fn init_features(&self, pixel: &[f64], out: &mut [f64]) {
        out.copy_from_slice(pixel);
    }

    fn dissimilarity(
        &self,
        graph: &SegmentGraph,
        a: u32,
        b: u32,
        _border: u32,
        merged: &mut [f64],
    ) -> f64 {
        let (mean_a, mean_b) = (graph.features(a), graph.features(b));
        let (size_a, size_b) = (graph.size(a) as f64, graph.size(b) as f64);
        let total = size_a + size_b;
        for band in 0..self.bands {
            merged[band] = (mean_a[band] * size_a + mean_b[band] * size_b) / total;
        }
        euclidean(mean_a, mean_b)
    }
}

#[derive(Debug, Default)]
pub struct RegionGrowingMeanStrategy {
    params: StrategyParameters,
}

impl RegionGrowingMeanStrategy {
    pub const NAME: &'static str = "region-growing-mean";
}

impl SegmentationStrategy for RegionGrowingMeanStrategy {
    fn initialize(&mut self, params: &StrategyParameters) -> Result<(), SegmenterError> {
        if params.min_segment_size == 0 {
            return Err(SegmenterError::StrategyInit(
                "min_segment_size must be positive".to_string(),
            ));
        }
        if params.similarity_threshold.is_nan() || params.similarity_threshold < 0.0 {
            return Err(SegmenterError::StrategyInit(format!(
                "similarity_threshold must be a non-negative number, got {}",
                params.similarity_threshold
            )));
        }
        self.params = params.clone();
        Ok(())
    }

    fn execute(
        &mut self,
        ids: &SegmentIdAllocator,
        block: &SegmentsBlock,
        input: &BlockWindow,
        output: &mut LabelWindow,
        progress: Option<&dyn ProgressReporter>,
    ) -> Result<(), SegmenterError> {
        let rules = PassRules {
            mutual_best: true,
            same_iteration: true,
        };
        let mut merger = MeanMerger {
            bands: input.band_count(),
        };
        grow(
            &mut merger,
            &self.params,
            rules,
            rules,
            ids,
            block,
            input,
            output,
            progress,
        )
    }

    fn mem_usage_estimation(&self, band_count: usize, pixels: usize) -> f64 {
        let f64_size = std::mem::size_of::<f64>();
        // window and mean features, segment size, box, parent, alive flag, iteration stamp and
        // six neighbour edges, pixel to segment map and label
        let per_pixel = 2 * band_count * f64_size + 4 + 16 + 4 + 1 + 4 + 6 * 8 + 4 + 4;
        (per_pixel * pixels) as f64
    }

    fn optimal_blocks_overlap(&self) -> usize {
        (self.params.min_segment_size as f64).sqrt() as usize
    }

    fn seam_merge_allowed(&self, a: &[f64], b: &[f64]) -> bool {
        euclidean(a, b) <= self.params.similarity_threshold
    }
}
