/// The Cinderella recipe's target total.
pub const TARGET_TOTAL_ML: f64 = 90.0;

/// Points lost per millilitre of deviation from the target.
pub const POINTS_PER_ML: f64 = 5.0;

/// `clamp(round(100 - 5 * |total - 90|), 0, 100)`.
pub fn score(total_weight: f64) -> u32 {
    let raw = (100.0 - POINTS_PER_ML * deviation(total_weight)).round();
    raw.clamp(0.0, 100.0) as u32
}

pub fn deviation(total_weight: f64) -> f64 {
    (total_weight - TARGET_TOTAL_ML).abs()
}
