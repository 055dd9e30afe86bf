// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-owned-tile composition state.
//!
//! Each owned tile carries accumulation planes and one of three reduction
//! policies behind a uniform `new_frame` / `process` / `is_complete`
//! contract. Overwrite and z-composite are commutative reductions, and
//! alpha-blend sorts buffered fragments by depth before compositing, so
//! the order in which fragments for one tile are processed never changes
//! the final pixels.

use quilt_common::{pixel, Channels, Fragment, PixelFormat, TileDesc, TILE_PIXELS};

/// The reduction policy applied to fragments of the same tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameMode {
    /// Fragments are summed and normalized by the expected contribution
    /// count; the variance planes drive the per-tile error estimate.
    #[default]
    Overwrite,
    /// Fragments carry depth and are composited front-to-back with the
    /// over operator once all of them have arrived.
    AlphaBlend,
    /// One contribution per worker; the per-pixel minimum-depth fragment
    /// wins.
    ZComposite,
}

/// One f32 plane per color channel.
#[derive(Debug, Clone)]
pub(crate) struct ColorPlanes {
    pub r: Vec<f32>,
    pub g: Vec<f32>,
    pub b: Vec<f32>,
    pub a: Vec<f32>,
}

impl ColorPlanes {
    fn zeroed() -> Self {
        Self {
            r: vec![0.0; TILE_PIXELS],
            g: vec![0.0; TILE_PIXELS],
            b: vec![0.0; TILE_PIXELS],
            a: vec![0.0; TILE_PIXELS],
        }
    }

    fn zero(&mut self) {
        self.r.fill(0.0);
        self.g.fill(0.0);
        self.b.fill(0.0);
        self.a.fill(0.0);
    }

    fn add_fragment(&mut self, fragment: &Fragment) {
        for i in 0..TILE_PIXELS {
            self.r[i] += fragment.r[i];
            self.g[i] += fragment.g[i];
            self.b[i] += fragment.b[i];
            self.a[i] += fragment.a[i];
        }
    }
}

/// The six auxiliary planes: normal and albedo.
#[derive(Debug, Clone)]
pub(crate) struct AuxPlanes {
    pub nx: Vec<f32>,
    pub ny: Vec<f32>,
    pub nz: Vec<f32>,
    pub ar: Vec<f32>,
    pub ag: Vec<f32>,
    pub ab: Vec<f32>,
}

impl AuxPlanes {
    fn zeroed() -> Self {
        Self {
            nx: vec![0.0; TILE_PIXELS],
            ny: vec![0.0; TILE_PIXELS],
            nz: vec![0.0; TILE_PIXELS],
            ar: vec![0.0; TILE_PIXELS],
            ag: vec![0.0; TILE_PIXELS],
            ab: vec![0.0; TILE_PIXELS],
        }
    }

    fn zero(&mut self) {
        self.nx.fill(0.0);
        self.ny.fill(0.0);
        self.nz.fill(0.0);
        self.ar.fill(0.0);
        self.ag.fill(0.0);
        self.ab.fill(0.0);
    }

    fn add_fragment(&mut self, fragment: &Fragment) {
        for i in 0..TILE_PIXELS {
            self.nx[i] += fragment.nx[i];
            self.ny[i] += fragment.ny[i];
            self.nz[i] += fragment.nz[i];
            self.ar[i] += fragment.ar[i];
            self.ag[i] += fragment.ag[i];
            self.ab[i] += fragment.ab[i];
        }
    }

    fn copy_pixel(&mut self, i: usize, fragment: &Fragment) {
        self.nx[i] = fragment.nx[i];
        self.ny[i] = fragment.ny[i];
        self.nz[i] = fragment.nz[i];
        self.ar[i] = fragment.ar[i];
        self.ag[i] = fragment.ag[i];
        self.ab[i] = fragment.ab[i];
    }

    fn scale(&mut self, factor: f32) {
        for plane in [
            &mut self.nx,
            &mut self.ny,
            &mut self.nz,
            &mut self.ar,
            &mut self.ag,
            &mut self.ab,
        ] {
            for v in plane.iter_mut() {
                *v *= factor;
            }
        }
    }
}

/// Color planes plus depth and optional aux planes.
#[derive(Debug, Clone)]
pub(crate) struct TilePlanes {
    pub color: ColorPlanes,
    pub z: Vec<f32>,
    pub aux: Option<AuxPlanes>,
}

impl TilePlanes {
    fn new(with_aux: bool) -> Self {
        Self {
            color: ColorPlanes::zeroed(),
            z: vec![f32::INFINITY; TILE_PIXELS],
            aux: with_aux.then(AuxPlanes::zeroed),
        }
    }

    fn reset(&mut self) {
        self.color.zero();
        self.z.fill(f32::INFINITY);
        if let Some(aux) = &mut self.aux {
            aux.zero();
        }
    }
}

#[derive(Debug)]
enum CompositeState {
    Overwrite {
        expected: u32,
        received: u32,
    },
    AlphaBlend {
        expected: u32,
        fragments: Vec<Box<Fragment>>,
    },
    ZComposite {
        expected: u32,
        received: u32,
    },
}

/// Composition state for one owned tile.
#[derive(Debug)]
pub(crate) struct OwnedTile {
    pub desc: TileDesc,
    format: PixelFormat,
    /// Per-frame fragment accumulation.
    pub accum: TilePlanes,
    /// Every second fragment, for the half-sample error estimate.
    pub variance: ColorPlanes,
    /// Output of the last completed frame.
    pub resolved: TilePlanes,
    /// `resolved` converted to the typed output format.
    pub color: Vec<u8>,
    /// Error estimate of the last completed frame; `+inf` means unknown.
    pub error: f32,
    state: CompositeState,
}

impl OwnedTile {
    pub fn new(
        desc: TileDesc,
        mode: FrameMode,
        format: PixelFormat,
        channels: Channels,
        num_workers: u32,
    ) -> Self {
        let with_aux =
            channels.contains(Channels::NORMAL) || channels.contains(Channels::ALBEDO);
        let state = match mode {
            FrameMode::Overwrite => CompositeState::Overwrite {
                expected: 1,
                received: 0,
            },
            FrameMode::AlphaBlend => CompositeState::AlphaBlend {
                expected: 1,
                fragments: Vec::new(),
            },
            FrameMode::ZComposite => CompositeState::ZComposite {
                expected: num_workers,
                received: 0,
            },
        };
        Self {
            desc,
            format,
            accum: TilePlanes::new(with_aux),
            variance: ColorPlanes::zeroed(),
            resolved: TilePlanes::new(with_aux),
            color: vec![0u8; TILE_PIXELS * format.pixel_size()],
            error: f32::INFINITY,
            state,
        }
    }

    /// Reset the per-frame accumulation and contribution bookkeeping.
    /// The resolved planes of the previous frame are kept.
    pub fn new_frame(&mut self, instances: i32) {
        self.accum.reset();
        self.variance.zero();
        match &mut self.state {
            CompositeState::Overwrite { expected, received } => {
                *expected = instances.max(1) as u32;
                *received = 0;
            }
            CompositeState::AlphaBlend {
                expected,
                fragments,
            } => {
                *expected = instances.max(1) as u32;
                fragments.clear();
            }
            CompositeState::ZComposite { received, .. } => {
                *received = 0;
            }
        }
    }

    /// Whether all expected contributions for this frame have arrived.
    pub fn is_complete(&self) -> bool {
        match &self.state {
            CompositeState::Overwrite { expected, received }
            | CompositeState::ZComposite { expected, received } => received == expected,
            CompositeState::AlphaBlend {
                expected,
                fragments,
            } => fragments.len() as u32 == *expected,
        }
    }

    /// Composite one contribution. Returns true when the tile completed
    /// with this fragment: the resolved planes, output color buffer and
    /// error estimate are then current.
    pub fn process(&mut self, fragment: &Fragment) -> bool {
        assert!(
            !self.is_complete(),
            "fragment for tile {} arrived after the tile completed its frame",
            self.desc.id
        );
        match &mut self.state {
            CompositeState::Overwrite { expected, received } => {
                *received += 1;
                self.accum.color.add_fragment(fragment);
                if let Some(aux) = &mut self.accum.aux {
                    aux.add_fragment(fragment);
                }
                for i in 0..TILE_PIXELS {
                    self.accum.z[i] = self.accum.z[i].min(fragment.z[i]);
                }
                if *received % 2 == 0 {
                    self.variance.add_fragment(fragment);
                }
                if received < expected {
                    return false;
                }
                let n = *expected;
                Self::resolve_overwrite(&mut self.resolved, &self.accum, n);
                self.error = Self::estimate_error(&self.accum.color, &self.variance, n);
                true
            }
            CompositeState::AlphaBlend {
                expected,
                fragments,
            } => {
                let mut stored: Box<Fragment> = bytemuck::zeroed_box();
                *stored = *fragment;
                fragments.push(stored);
                if (fragments.len() as u32) < *expected {
                    return false;
                }
                // Near-to-far by the fragment's leading depth value.
                fragments.sort_by(|a, b| a.z[0].total_cmp(&b.z[0]));
                Self::resolve_alpha_blend(&mut self.resolved, fragments);
                self.error = f32::INFINITY;
                true
            }
            CompositeState::ZComposite { expected, received } => {
                *received += 1;
                for i in 0..TILE_PIXELS {
                    if fragment.z[i] < self.accum.z[i] {
                        self.accum.z[i] = fragment.z[i];
                        self.accum.color.r[i] = fragment.r[i];
                        self.accum.color.g[i] = fragment.g[i];
                        self.accum.color.b[i] = fragment.b[i];
                        self.accum.color.a[i] = fragment.a[i];
                        if let Some(aux) = &mut self.accum.aux {
                            aux.copy_pixel(i, fragment);
                        }
                    }
                }
                if received < expected {
                    return false;
                }
                self.resolved.color = self.accum.color.clone();
                self.resolved.z.copy_from_slice(&self.accum.z);
                self.resolved.aux = self.accum.aux.clone();
                self.error = f32::INFINITY;
                true
            }
        }
    }

    fn resolve_overwrite(resolved: &mut TilePlanes, accum: &TilePlanes, n: u32) {
        let scale = 1.0 / n as f32;
        for i in 0..TILE_PIXELS {
            resolved.color.r[i] = accum.color.r[i] * scale;
            resolved.color.g[i] = accum.color.g[i] * scale;
            resolved.color.b[i] = accum.color.b[i] * scale;
            resolved.color.a[i] = accum.color.a[i] * scale;
        }
        resolved.z.copy_from_slice(&accum.z);
        if let (Some(resolved_aux), Some(accum_aux)) = (&mut resolved.aux, &accum.aux) {
            *resolved_aux = accum_aux.clone();
            resolved_aux.scale(scale);
        }
    }

    /// Mean absolute difference between the full-sample and half-sample
    /// estimates. Unknown (`+inf`) below two contributions.
    fn estimate_error(accum: &ColorPlanes, variance: &ColorPlanes, n: u32) -> f32 {
        if n < 2 {
            return f32::INFINITY;
        }
        let full = 1.0 / n as f32;
        let half = 1.0 / (n / 2) as f32;
        let mut sum = 0.0f32;
        for i in 0..TILE_PIXELS {
            sum += (accum.r[i] * full - variance.r[i] * half).abs();
            sum += (accum.g[i] * full - variance.g[i] * half).abs();
            sum += (accum.b[i] * full - variance.b[i] * half).abs();
            sum += (accum.a[i] * full - variance.a[i] * half).abs();
        }
        sum / TILE_PIXELS as f32
    }

    fn resolve_alpha_blend(resolved: &mut TilePlanes, fragments: &[Box<Fragment>]) {
        resolved.reset();
        for fragment in fragments {
            for i in 0..TILE_PIXELS {
                let transmitted = 1.0 - resolved.color.a[i];
                resolved.color.r[i] += transmitted * fragment.r[i];
                resolved.color.g[i] += transmitted * fragment.g[i];
                resolved.color.b[i] += transmitted * fragment.b[i];
                resolved.color.a[i] += transmitted * fragment.a[i];
                resolved.z[i] = resolved.z[i].min(fragment.z[i]);
            }
        }
        if let (Some(aux), Some(front)) = (&mut resolved.aux, fragments.first()) {
            for i in 0..TILE_PIXELS {
                aux.copy_pixel(i, front);
            }
        }
    }

    /// Convert the resolved color planes into the typed output buffer.
    /// Runs after the user pixel operator has seen the planes.
    pub fn encode_color(&mut self) {
        if self.format == PixelFormat::None {
            return;
        }
        pixel::encode_tile(
            self.format,
            &self.resolved.color.r,
            &self.resolved.color.g,
            &self.resolved.color.b,
            &self.resolved.color.a,
            &mut self.color,
        );
    }

    /// Zero the requested channels.
    pub fn clear(&mut self, channels: Channels) {
        if channels.contains(Channels::ACCUM) {
            self.accum.reset();
            // Clearing the accumulation also clears the variance estimate.
            self.variance.zero();
        }
        if channels.contains(Channels::DEPTH) {
            self.resolved.z.fill(f32::INFINITY);
        }
        if channels.contains(Channels::COLOR) {
            self.resolved.color.zero();
            self.color.fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_desc() -> TileDesc {
        TileDesc {
            origin_x: 0,
            origin_y: 0,
            id: 0,
            owner: 0,
        }
    }

    fn overwrite_tile(channels: Channels) -> OwnedTile {
        OwnedTile::new(
            test_desc(),
            FrameMode::Overwrite,
            PixelFormat::Rgba8,
            channels,
            1,
        )
    }

    #[test]
    fn overwrite_normalizes_by_expected_contributions() {
        let mut tile = overwrite_tile(Channels::COLOR);
        tile.new_frame(2);
        assert!(!tile.process(&Fragment::solid(0, 0, [1.0, 0.0, 0.0, 1.0], 1.0)));
        assert!(tile.process(&Fragment::solid(0, 0, [0.0, 1.0, 0.0, 1.0], 2.0)));
        assert!(tile.is_complete());
        assert_eq!(tile.resolved.color.r[0], 0.5);
        assert_eq!(tile.resolved.color.g[0], 0.5);
        assert_eq!(tile.resolved.color.a[0], 1.0);
        assert_eq!(tile.resolved.z[0], 1.0);
        tile.encode_color();
        assert_eq!(&tile.color[0..4], &[128, 128, 0, 255]);
    }

    #[test]
    fn overwrite_error_is_zero_for_identical_fragments() {
        let mut tile = overwrite_tile(Channels::COLOR | Channels::VARIANCE);
        tile.new_frame(2);
        let fragment = Fragment::solid(0, 0, [0.5, 0.5, 0.5, 1.0], 1.0);
        tile.process(&fragment);
        tile.process(&fragment);
        assert_eq!(tile.error, 0.0);
    }

    #[test]
    fn overwrite_error_grows_with_divergent_fragments() {
        let mut tile = overwrite_tile(Channels::COLOR | Channels::VARIANCE);
        tile.new_frame(2);
        tile.process(&Fragment::solid(0, 0, [0.0, 0.0, 0.0, 1.0], 1.0));
        tile.process(&Fragment::solid(0, 0, [1.0, 1.0, 1.0, 1.0], 1.0));
        // full = 0.5 per channel, half = 1.0: three color channels differ.
        assert!((tile.error - 1.5).abs() < 1e-5);
    }

    #[test]
    fn single_contribution_error_is_unknown() {
        let mut tile = overwrite_tile(Channels::COLOR | Channels::VARIANCE);
        tile.new_frame(1);
        assert!(tile.process(&Fragment::solid(0, 0, [1.0, 0.0, 0.0, 1.0], 1.0)));
        assert!(tile.error.is_infinite());
    }

    #[test]
    fn new_frame_resets_contributions() {
        let mut tile = overwrite_tile(Channels::COLOR);
        tile.new_frame(1);
        tile.process(&Fragment::solid(0, 0, [1.0, 1.0, 1.0, 1.0], 1.0));
        assert!(tile.is_complete());
        tile.new_frame(1);
        assert!(!tile.is_complete());
        tile.process(&Fragment::solid(0, 0, [0.0, 1.0, 0.0, 1.0], 1.0));
        assert_eq!(tile.resolved.color.g[0], 1.0);
        assert_eq!(tile.resolved.color.r[0], 0.0);
    }

    #[test]
    #[should_panic(expected = "after the tile completed")]
    fn extra_fragment_after_completion_is_fatal() {
        let mut tile = overwrite_tile(Channels::COLOR);
        tile.new_frame(1);
        tile.process(&Fragment::solid(0, 0, [1.0, 1.0, 1.0, 1.0], 1.0));
        tile.process(&Fragment::solid(0, 0, [1.0, 1.0, 1.0, 1.0], 1.0));
    }

    #[test]
    fn z_composite_selects_minimum_depth_per_pixel() {
        let mut tile = OwnedTile::new(
            test_desc(),
            FrameMode::ZComposite,
            PixelFormat::Rgba8,
            Channels::COLOR | Channels::DEPTH,
            3,
        );
        tile.new_frame(0);

        let mut near_left = Fragment::solid(0, 0, [1.0, 0.0, 0.0, 1.0], 1.0);
        for i in 0..TILE_PIXELS {
            if i % 2 == 1 {
                near_left.z[i] = 9.0;
            }
        }
        let mut near_right = Fragment::solid(0, 0, [0.0, 1.0, 0.0, 1.0], 2.0);
        for i in 0..TILE_PIXELS {
            if i % 2 == 0 {
                near_right.z[i] = 9.0;
            }
        }
        let far = Fragment::solid(0, 0, [0.0, 0.0, 1.0, 1.0], 5.0);

        assert!(!tile.process(&far));
        assert!(!tile.process(&near_left));
        assert!(tile.process(&near_right));

        // Even pixels come from near_left (z=1), odd from near_right (z=2).
        assert_eq!(tile.resolved.color.r[0], 1.0);
        assert_eq!(tile.resolved.z[0], 1.0);
        assert_eq!(tile.resolved.color.g[1], 1.0);
        assert_eq!(tile.resolved.z[1], 2.0);
    }

    #[test]
    fn z_composite_is_order_independent() {
        let fragments = [
            Fragment::solid(0, 0, [1.0, 0.0, 0.0, 1.0], 3.0),
            Fragment::solid(0, 0, [0.0, 1.0, 0.0, 1.0], 1.0),
            Fragment::solid(0, 0, [0.0, 0.0, 1.0, 1.0], 2.0),
        ];
        let mut forward = OwnedTile::new(
            test_desc(),
            FrameMode::ZComposite,
            PixelFormat::Rgba8,
            Channels::COLOR,
            3,
        );
        forward.new_frame(0);
        let mut reverse = OwnedTile::new(
            test_desc(),
            FrameMode::ZComposite,
            PixelFormat::Rgba8,
            Channels::COLOR,
            3,
        );
        reverse.new_frame(0);

        for fragment in &fragments {
            forward.process(fragment);
        }
        for fragment in fragments.iter().rev() {
            reverse.process(fragment);
        }
        assert_eq!(forward.resolved.color.g[7], reverse.resolved.color.g[7]);
        assert_eq!(forward.resolved.color.g[7], 1.0);
    }

    #[test]
    fn alpha_blend_composites_front_to_back_regardless_of_arrival() {
        // An opaque red surface at z=1 must hide a green one at z=2,
        // whichever arrives first.
        let near = Fragment::solid(0, 0, [1.0, 0.0, 0.0, 1.0], 1.0);
        let far = Fragment::solid(0, 0, [0.0, 1.0, 0.0, 1.0], 2.0);

        for order in [[&near, &far], [&far, &near]] {
            let mut tile = OwnedTile::new(
                test_desc(),
                FrameMode::AlphaBlend,
                PixelFormat::Rgba8,
                Channels::COLOR,
                1,
            );
            tile.new_frame(2);
            assert!(!tile.process(order[0]));
            assert!(tile.process(order[1]));
            assert_eq!(tile.resolved.color.r[0], 1.0);
            assert_eq!(tile.resolved.color.g[0], 0.0);
            assert_eq!(tile.resolved.z[0], 1.0);
        }
    }

    #[test]
    fn alpha_blend_accumulates_translucency() {
        let mut tile = OwnedTile::new(
            test_desc(),
            FrameMode::AlphaBlend,
            PixelFormat::Rgba8,
            Channels::COLOR,
            1,
        );
        tile.new_frame(2);
        // Premultiplied half-transparent red over opaque green.
        tile.process(&Fragment::solid(0, 0, [0.5, 0.0, 0.0, 0.5], 1.0));
        tile.process(&Fragment::solid(0, 0, [0.0, 1.0, 0.0, 1.0], 2.0));
        assert_eq!(tile.resolved.color.r[0], 0.5);
        assert_eq!(tile.resolved.color.g[0], 0.5);
        assert_eq!(tile.resolved.color.a[0], 1.0);
    }

    #[test]
    fn clear_touches_only_requested_channels() {
        let mut tile = overwrite_tile(Channels::COLOR | Channels::DEPTH);
        tile.new_frame(1);
        tile.process(&Fragment::solid(0, 0, [1.0, 1.0, 1.0, 1.0], 2.5));
        tile.clear(Channels::DEPTH);
        assert!(tile.resolved.z[0].is_infinite());
        assert_eq!(tile.resolved.color.r[0], 1.0);
        tile.clear(Channels::COLOR);
        assert_eq!(tile.resolved.color.r[0], 0.0);
        assert_eq!(tile.color[0], 0);
    }
}
