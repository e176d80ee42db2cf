//! Connected-component labeling over float grids via union-find.
//!
//! Two selection predicates are supported: *sentinel regions* (pixels whose
//! value is `UNK`, 4- or 8-connected) used for hole analysis, and *similarity
//! regions* (known pixels whose left/top neighbor differs by at most a
//! threshold) used to prune small disparity islands.

use crate::grid::{Grid, UNK};

/// Neighborhood used when growing sentinel regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Connectivity {
    Four,
    Eight,
}

/// Size and bounding box of one labeled region.
#[derive(Debug, Clone, Copy)]
pub struct Component {
    /// Number of pixels in the region.
    pub size: usize,
    pub x1: usize,
    pub x2: usize,
    pub y1: usize,
    pub y2: usize,
}

/// Label image plus per-component statistics.
///
/// Labels are consecutive starting at 1; label 0 means "not part of any
/// tracked region" and `components[0]` is an empty placeholder so that
/// `components[label]` indexes directly.
#[derive(Debug, Clone)]
pub struct ComponentMap {
    pub labels: Vec<u32>,
    pub components: Vec<Component>,
}

impl ComponentMap {
    pub fn label_at(&self, grid: &Grid, x: usize, y: usize) -> u32 {
        self.labels[y * grid.width() + x]
    }

    /// Number of real components (label 0 excluded).
    pub fn len(&self) -> usize {
        self.components.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Union-find over provisional labels. parent[i] == 0 marks a root.
fn find(mut i: u32, parent: &mut [u32]) -> u32 {
    let start = i;
    while parent[i as usize] != 0 {
        i = parent[i as usize];
    }
    if i != start {
        parent[start as usize] = i;
    }
    i
}

fn union(i: u32, j: u32, parent: &mut [u32]) -> u32 {
    let ri = find(i, parent);
    let rj = find(j, parent);
    if ri != rj {
        parent[rj as usize] = ri;
    }
    ri
}

// Union that treats label 0 as "no label".
fn combine(i: u32, j: u32, parent: &mut [u32]) -> u32 {
    if i == 0 {
        j
    } else if j == 0 {
        i
    } else {
        union(i, j, parent)
    }
}

const EMPTY: Component = Component {
    size: 0,
    x1: usize::MAX,
    x2: 0,
    y1: usize::MAX,
    y2: 0,
};

/// Shared second pass: remap provisional labels to consecutive ids and
/// accumulate size and bounding box.
fn finalize(grid: &Grid, labels: &mut [u32], parent: &mut [u32]) -> Vec<Component> {
    let (w, h) = (grid.width(), grid.height());
    let mut next = 0u32;
    let mut remap = vec![0u32; parent.len()];
    let mut components = vec![EMPTY];
    for i in 1..parent.len() {
        if parent[i] == 0 {
            next += 1;
            remap[i] = next;
            components.push(EMPTY);
        }
    }
    for y in 0..h {
        for x in 0..w {
            let c = labels[y * w + x];
            if c > 0 {
                let k = remap[find(c, parent) as usize];
                labels[y * w + x] = k;
                let comp = &mut components[k as usize];
                comp.size += 1;
                comp.x1 = comp.x1.min(x);
                comp.x2 = comp.x2.max(x);
                comp.y1 = comp.y1.min(y);
                comp.y2 = comp.y2.max(y);
            }
        }
    }
    components
}

/// Label connected regions of `UNK` pixels in `band`.
pub fn label_unknown_regions(grid: &Grid, band: usize, connectivity: Connectivity) -> ComponentMap {
    let (w, h) = (grid.width(), grid.height());
    let mut labels = vec![0u32; w * h];
    let mut parent = vec![0u32]; // index 0 unused

    for y in 0..h {
        for x in 0..w {
            if grid.get(x, y, band) != UNK {
                continue;
            }
            let left = if x > 0 { labels[y * w + x - 1] } else { 0 };
            let top = if y > 0 { labels[(y - 1) * w + x] } else { 0 };
            let mut c = combine(left, top, &mut parent);
            if connectivity == Connectivity::Eight && y > 0 {
                let tl = if x > 0 { labels[(y - 1) * w + x - 1] } else { 0 };
                let tr = if x < w - 1 { labels[(y - 1) * w + x + 1] } else { 0 };
                c = combine(c, tl, &mut parent);
                c = combine(c, tr, &mut parent);
            }
            if c == 0 {
                parent.push(0);
                c = (parent.len() - 1) as u32;
            }
            labels[y * w + x] = c;
        }
    }

    let components = finalize(grid, &mut labels, &mut parent);
    log::debug!("found {} unknown-region components", components.len() - 1);
    ComponentMap { labels, components }
}

/// Label regions of known pixels connected by value similarity: a pixel
/// joins its left/top neighbor when the absolute difference is at most
/// `threshold`.
pub fn label_similar_regions(grid: &Grid, band: usize, threshold: f32) -> ComponentMap {
    let (w, h) = (grid.width(), grid.height());
    let mut labels = vec![0u32; w * h];
    let mut parent = vec![0u32];

    for y in 0..h {
        for x in 0..w {
            let val = grid.get(x, y, band);
            if val == UNK {
                continue;
            }
            let left = if x > 0 { grid.get(x - 1, y, band) } else { UNK };
            let top = if y > 0 { grid.get(x, y - 1, band) } else { UNK };
            let mut c = 0;
            if (left - val).abs() <= threshold {
                c = labels[y * w + x - 1];
            }
            if (top - val).abs() <= threshold {
                c = combine(c, labels[(y - 1) * w + x], &mut parent);
            }
            if c == 0 {
                parent.push(0);
                c = (parent.len() - 1) as u32;
            }
            labels[y * w + x] = c;
        }
    }

    let components = finalize(grid, &mut labels, &mut parent);
    log::debug!("found {} similarity components", components.len() - 1);
    ComponentMap { labels, components }
}
