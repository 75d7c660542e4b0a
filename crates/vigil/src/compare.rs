//! Image comparator.
//!
//! Compares a candidate region capture against a stored baseline and returns
//! a similarity score in `[0, 1]`. Ordered by cost: an exact content-hash
//! check first, then dimension normalization with a smooth filter, then one
//! of three interchangeable scoring strategies. Undecodable input is a hard
//! mismatch with score 0.0 — it must never abort a run.

use image::imageops::FilterType;
use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Scoring strategy, selectable per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareStrategy {
    /// Mean absolute per-channel difference. Cheapest, noise-sensitive.
    PixelDiff,
    /// Gradient-direction bit signature on a small grayscale grid.
    /// Tolerant of minor color and compression variation.
    PerceptualHash,
    /// Global-window structural similarity over grayscale intensities.
    /// Most robust against anti-aliasing and sub-pixel rendering drift.
    #[default]
    Ssim,
}

/// Result of one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompareOutcome {
    pub is_match: bool,
    pub score: f64,
}

/// Stateless comparator configured with one scoring strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Comparator {
    strategy: CompareStrategy,
}

// pHash grid: 9 columns so each of the 8 rows yields 8 horizontal gradients.
const PHASH_COLS: u32 = 9;
const PHASH_ROWS: u32 = 8;
const PHASH_BITS: u32 = (PHASH_COLS - 1) * PHASH_ROWS;

// Standard SSIM stabilizers for 8-bit dynamic range.
const SSIM_C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const SSIM_C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

impl Comparator {
    pub fn new(strategy: CompareStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> CompareStrategy {
        self.strategy
    }

    /// Compare encoded image bytes. `threshold` decides the match verdict;
    /// the score is always reported so callers can log near-misses.
    pub fn compare(&self, baseline: &[u8], candidate: &[u8], threshold: f64) -> CompareOutcome {
        // Identical bytes are the common "nothing changed" case.
        if blake3::hash(baseline) == blake3::hash(candidate) {
            return CompareOutcome {
                is_match: true,
                score: 1.0,
            };
        }

        let base = match image::load_from_memory(baseline) {
            Ok(img) => img.to_rgba8(),
            Err(e) => {
                warn!("baseline image failed to decode, treating as mismatch: {e}");
                return CompareOutcome {
                    is_match: false,
                    score: 0.0,
                };
            }
        };
        let cand = match image::load_from_memory(candidate) {
            Ok(img) => img.to_rgba8(),
            Err(e) => {
                warn!("candidate image failed to decode, treating as mismatch: {e}");
                return CompareOutcome {
                    is_match: false,
                    score: 0.0,
                };
            }
        };

        // Resample the candidate onto the baseline's grid with a smooth
        // filter. Nearest-neighbor would manufacture large diffs from
        // aliasing alone.
        let cand = if cand.dimensions() != base.dimensions() {
            debug!(
                "normalizing candidate {}x{} to baseline {}x{}",
                cand.width(),
                cand.height(),
                base.width(),
                base.height()
            );
            image::imageops::resize(&cand, base.width(), base.height(), FilterType::Triangle)
        } else {
            cand
        };

        let score = match self.strategy {
            CompareStrategy::PixelDiff => pixel_diff_score(&base, &cand),
            CompareStrategy::PerceptualHash => phash_score(&base, &cand),
            CompareStrategy::Ssim => ssim_score(&base, &cand),
        }
        .clamp(0.0, 1.0);

        CompareOutcome {
            is_match: score >= threshold,
            score,
        }
    }
}

fn pixel_diff_score(a: &RgbaImage, b: &RgbaImage) -> f64 {
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    let mean = total as f64 / a.as_raw().len() as f64 / 255.0;
    1.0 - mean
}

fn phash_bits(img: &GrayImage) -> u64 {
    let mut bits: u64 = 0;
    let mut bit = 0;
    for y in 0..PHASH_ROWS {
        for x in 0..PHASH_COLS - 1 {
            if img.get_pixel(x, y).0[0] > img.get_pixel(x + 1, y).0[0] {
                bits |= 1 << bit;
            }
            bit += 1;
        }
    }
    bits
}

fn phash_score(a: &RgbaImage, b: &RgbaImage) -> f64 {
    let small_a = image::imageops::resize(a, PHASH_COLS, PHASH_ROWS, FilterType::Triangle);
    let small_b = image::imageops::resize(b, PHASH_COLS, PHASH_ROWS, FilterType::Triangle);
    let gray_a = image::imageops::grayscale(&small_a);
    let gray_b = image::imageops::grayscale(&small_b);
    let hamming = (phash_bits(&gray_a) ^ phash_bits(&gray_b)).count_ones();
    1.0 - hamming as f64 / PHASH_BITS as f64
}

fn ssim_score(a: &RgbaImage, b: &RgbaImage) -> f64 {
    let gray_a = image::imageops::grayscale(a);
    let gray_b = image::imageops::grayscale(b);
    let n = (gray_a.width() * gray_a.height()) as f64;

    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    for (pa, pb) in gray_a.pixels().zip(gray_b.pixels()) {
        sum_a += pa.0[0] as f64;
        sum_b += pb.0[0] as f64;
    }
    let mean_a = sum_a / n;
    let mean_b = sum_b / n;

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for (pa, pb) in gray_a.pixels().zip(gray_b.pixels()) {
        let da = pa.0[0] as f64 - mean_a;
        let db = pb.0[0] as f64 - mean_b;
        var_a += da * da;
        var_b += db * db;
        cov += da * db;
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    // Single global window is sufficient at the ~100x100 region scale.
    let numerator = (2.0 * mean_a * mean_b + SSIM_C1) * (2.0 * cov + SSIM_C2);
    let denominator = (mean_a * mean_a + mean_b * mean_b + SSIM_C1) * (var_a + var_b + SSIM_C2);
    numerator / denominator
}
