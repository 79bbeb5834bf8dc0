use rand::rngs::SmallRng;
use rand::Rng;

/// Dense f64 vector helpers for the descent kit. Everything operates
/// on plain slices; dimensions are small (one coordinate per typed
/// variable on the path).
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn length(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

pub fn axis(n: usize, i: usize) -> Vec<f64> {
    let mut v = vec![0.0; n];
    v[i] = 1.0;
    v
}

pub fn scale(v: &mut [f64], a: f64) {
    for x in v {
        *x *= a;
    }
}

pub fn scaled(v: &[f64], a: f64) -> Vec<f64> {
    v.iter().map(|x| x * a).collect()
}

pub fn add_scaled(dst: &mut [f64], a: f64, src: &[f64]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += a * s;
    }
}

pub fn added(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

pub fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

pub fn is_finite(v: &[f64]) -> bool {
    v.iter().all(|x| x.is_finite())
}

pub fn arg_inf(v: &[f64]) -> usize {
    let mut best = 0;
    for i in 1..v.len() {
        if v[i] < v[best] {
            best = i;
        }
    }
    best
}

/// Component of `a` orthogonal to `b`; `a` itself when `b` is
/// degenerate.
pub fn component_orthogonal_to(a: &[f64], b: &[f64]) -> Vec<f64> {
    let bb = dot(b, b);
    if !bb.is_finite() || bb < 1e-12 {
        return a.to_vec();
    }
    let mut out = a.to_vec();
    add_scaled(&mut out, -dot(a, b) / bb, b);
    out
}

/// A perturbation that is small relative to the magnitude it probes
/// around, floored so zero origins still move.
pub fn small_delta_around(x: f64) -> f64 {
    let delta = x.abs() * 1e-3;
    if delta.is_finite() && delta > 1e-9 {
        delta
    } else {
        1e-3
    }
}

const PASCAL_ROWS: usize = 65;

fn pascal_triangle() -> &'static Vec<Vec<u64>> {
    use std::sync::OnceLock;
    static TRIANGLE: OnceLock<Vec<Vec<u64>>> = OnceLock::new();
    TRIANGLE.get_or_init(|| {
        let mut rows: Vec<Vec<u64>> = Vec::with_capacity(PASCAL_ROWS);
        for n in 0..PASCAL_ROWS {
            let mut row = vec![1u64; n + 1];
            for k in 1..n {
                row[k] = rows[n - 1][k - 1].saturating_add(rows[n - 1][k]);
            }
            rows.push(row);
        }
        rows
    })
}

/// Binomial coefficient, saturating; `n` is clamped to the
/// precomputed triangle (sensitive-bit sets beyond 64 bits saturate
/// anyway).
pub fn n_choose_k(n: usize, k: usize) -> u64 {
    if k > n {
        return 0;
    }
    let n = n.min(PASCAL_ROWS - 1);
    let k = k.min(n);
    pascal_triangle()[n][k]
}

/// Distributes `total_samples` over the Hamming classes `0..=num_bits`
/// proportionally to class size, capping each count at the class size.
pub fn sample_counts_per_hamming_class(num_bits: usize, total_samples: usize) -> Vec<u64> {
    let weights: Vec<u64> = (0..=num_bits).map(|k| n_choose_k(num_bits, k)).collect();
    let total_weight: f64 = weights.iter().map(|&w| w as f64).sum();
    if total_weight == 0.0 {
        return vec![0; num_bits + 1];
    }
    weights
        .iter()
        .map(|&w| {
            let share = (total_samples as f64 * w as f64 / total_weight).round() as u64;
            share.clamp(u64::from(w > 0), w)
        })
        .collect()
}

/// One random member of the Hamming class: `hamming_class` bits set
/// out of `num_bits`.
pub fn generate_sample_of_hamming_class(
    num_bits: usize,
    hamming_class: usize,
    rng: &mut SmallRng,
) -> Vec<bool> {
    let mut bits = vec![false; num_bits];
    let mut remaining = hamming_class.min(num_bits);
    while remaining > 0 {
        let idx = rng.gen_range(0..num_bits);
        if !bits[idx] {
            bits[idx] = true;
            remaining -= 1;
        }
    }
    bits
}

/// Draws `count` distinct members of the class. Every duplicate seed
/// would later cost one client execution, so collisions are retried,
/// bounded at 1000 attempts per requested sample.
pub fn generate_samples_of_hamming_class(
    out: &mut Vec<Vec<bool>>,
    num_bits: usize,
    hamming_class: usize,
    count: u64,
    rng: &mut SmallRng,
) {
    let mut seen: std::collections::HashSet<Vec<bool>> = std::collections::HashSet::new();
    let max_attempts = 1000u64.saturating_mul(count.max(1));
    let mut attempts = 0u64;
    while (seen.len() as u64) < count {
        attempts += 1;
        if attempts > max_attempts {
            break;
        }
        let sample = generate_sample_of_hamming_class(num_bits, hamming_class, rng);
        if seen.insert(sample.clone()) {
            out.push(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn binomials() {
        assert_eq!(n_choose_k(8, 0), 1);
        assert_eq!(n_choose_k(8, 3), 56);
        assert_eq!(n_choose_k(8, 8), 1);
        assert_eq!(n_choose_k(3, 5), 0);
    }

    #[test]
    fn hamming_class_counts_respect_class_sizes() {
        let counts = sample_counts_per_hamming_class(4, 16);
        assert_eq!(counts.len(), 5);
        for (k, &count) in counts.iter().enumerate() {
            assert!(count <= n_choose_k(4, k));
            assert!(count >= 1);
        }
    }

    #[test]
    fn hamming_samples_have_requested_popcount() {
        let mut rng = SmallRng::seed_from_u64(11);
        for class in 0..=6 {
            let sample = generate_sample_of_hamming_class(6, class, &mut rng);
            assert_eq!(sample.iter().filter(|&&b| b).count(), class.min(6));
        }
    }

    #[test]
    fn hamming_class_samples_are_distinct() {
        let mut rng = SmallRng::seed_from_u64(13);
        let mut out = Vec::new();
        // Class 1 of 4 bits has exactly 4 members; ask for all of them.
        generate_samples_of_hamming_class(&mut out, 4, 1, 4, &mut rng);
        assert_eq!(out.len(), 4);
        let unique: std::collections::HashSet<_> = out.iter().cloned().collect();
        assert_eq!(unique.len(), out.len());
    }

    #[test]
    fn orthogonal_component() {
        let a = [1.0, 1.0];
        let b = [1.0, 0.0];
        let c = component_orthogonal_to(&a, &b);
        assert!(dot(&c, &b).abs() < 1e-12);
    }
}
