use std::collections::HashSet;

use time::OffsetDateTime;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Cosine similarity in -1.0..=1.0, or `None` when the vectors differ in length or either has no
/// magnitude.
pub fn cosine_similarity(lhs: &[f32], rhs: &[f32]) -> Option<f32> {
	if lhs.is_empty() || lhs.len() != rhs.len() {
		return None;
	}

	let mut dot = 0.0_f32;
	let mut lhs_norm = 0.0_f32;
	let mut rhs_norm = 0.0_f32;

	for (l, r) in lhs.iter().zip(rhs.iter()) {
		dot += l * r;
		lhs_norm += l * l;
		rhs_norm += r * r;
	}

	if lhs_norm <= f32::EPSILON || rhs_norm <= f32::EPSILON {
		return None;
	}

	Some((dot / (lhs_norm.sqrt() * rhs_norm.sqrt())).clamp(-1.0, 1.0))
}

/// Jaccard index of two tag sets, compared case-insensitively. Two empty sets score 0.0.
pub fn tag_jaccard(lhs: &[String], rhs: &[String]) -> f32 {
	let lhs = normalized_tags(lhs);
	let rhs = normalized_tags(rhs);

	if lhs.is_empty() && rhs.is_empty() {
		return 0.0;
	}

	let intersection = lhs.intersection(&rhs).count();
	let union = lhs.union(&rhs).count();

	if union == 0 {
		return 0.0;
	}

	intersection as f32 / union as f32
}

/// `1 - days_apart / max_window_days`, floored at 0.0 outside the window.
pub fn time_proximity(lhs: OffsetDateTime, rhs: OffsetDateTime, max_window_days: f32) -> f32 {
	if !max_window_days.is_finite() || max_window_days <= 0.0 {
		return 0.0;
	}

	let days_apart = days_between(lhs, rhs);

	(1.0 - days_apart / f64::from(max_window_days)).max(0.0) as f32
}

pub fn days_between(lhs: OffsetDateTime, rhs: OffsetDateTime) -> f64 {
	(lhs - rhs).abs().as_seconds_f64() / SECONDS_PER_DAY
}

fn normalized_tags(tags: &[String]) -> HashSet<String> {
	tags.iter()
		.map(|tag| tag.trim().to_lowercase())
		.filter(|tag| !tag.is_empty())
		.collect()
}
