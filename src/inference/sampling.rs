//! Next-token selection.
//!
//! Repetition penalty, temperature scaling, top-k and top-p (nucleus) filtering, and
//! multinomial sampling over a single row of logits.

use std::cmp::Ordering;

use rand::Rng;

/// Down-weight every token already present in `previous`.
///
/// Negative logits are multiplied by `penalty`, positive ones divided by it, so a penalty above
/// 1.0 always makes a repeat less likely. Each distinct token is penalised once.
pub fn apply_repetition_penalty(logits: &mut [f32], previous: &[u32], penalty: f32) {
    if (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    let mut seen = vec![false; logits.len()];
    for &token in previous {
        let idx = token as usize;
        if idx >= logits.len() || seen[idx] {
            continue;
        }
        seen[idx] = true;
        let v = &mut logits[idx];
        *v = if *v < 0.0 { *v * penalty } else { *v / penalty };
    }
}

/// Make `token` impossible to pick.
pub fn suppress_token(logits: &mut [f32], token: u32) {
    if let Some(v) = logits.get_mut(token as usize) {
        *v = f32::NEG_INFINITY;
    }
}

/// Sample a token id from a logits row after temperature, top-k and top-p filtering.
///
/// `temperature <= 0` is greedy. `top_k == 0` and `top_p` outside `[0, 1)` disable the
/// respective filter.
#[must_use]
pub fn sample_from_logits(
    logits: &[f32],
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: &mut impl Rng,
) -> u32 {
    if temperature <= 0.0 {
        return argmax(logits);
    }

    let mut filtered: Vec<f32> = logits.iter().map(|v| v / temperature).collect();

    if top_k > 0 && top_k < filtered.len() {
        top_k_filter_in_place(&mut filtered, top_k);
    }
    if (0.0..1.0).contains(&top_p) {
        top_p_filter_in_place(&mut filtered, top_p);
    }

    let probs = softmax(&filtered);
    if probs.iter().all(|p| *p == 0.0) {
        return argmax(logits);
    }
    sample_multinomial(&probs, rng)
}

/// Index of the largest finite logit, 0 if there is none.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold((0usize, f32::NEG_INFINITY), |best, (idx, &v)| {
            if v > best.1 { (idx, v) } else { best }
        })
        .0 as u32
}

fn descending(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn top_k_filter_in_place(logits: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = logits.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| descending(*a, *b));
    let kth = sorted
        .get(k.saturating_sub(1))
        .copied()
        .unwrap_or(f32::NEG_INFINITY);

    for v in logits.iter_mut().filter(|v| **v < kth) {
        *v = f32::NEG_INFINITY;
    }
}

/// Keep the smallest highest-probability set whose cumulative mass exceeds `top_p`.
fn top_p_filter_in_place(logits: &mut [f32], top_p: f32) {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| descending(logits[a], logits[b]));

    let probs = softmax(logits);
    if probs.iter().all(|p| *p == 0.0) {
        return;
    }

    let mut keep = vec![false; logits.len()];
    let mut cum = 0.0_f32;
    for &idx in &order {
        keep[idx] = true;
        cum += probs[idx];
        if cum > top_p {
            break;
        }
    }

    for (v, _) in logits.iter_mut().zip(&keep).filter(|(_, k)| !**k) {
        *v = f32::NEG_INFINITY;
    }
}

#[must_use]
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        return vec![0.0; logits.len()];
    }

    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max_logit).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
fn sample_multinomial(probs: &[f32], rng: &mut impl Rng) -> u32 {
    let r: f32 = rng.r#gen();
    let mut cum = 0.0_f32;
    for (idx, &p) in probs.iter().enumerate() {
        cum += p;
        if r < cum {
            return idx as u32;
        }
    }
    // Rounding left r above the final cumulative sum.
    probs.iter().rposition(|p| *p > 0.0).unwrap_or(0) as u32
}
