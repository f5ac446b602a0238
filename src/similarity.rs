//! # Similarity
//! Pure vector helpers: cosine similarity, centroid and cohesion.

use anyhow::{bail, Result};

/// Cosine similarity of two equal-length vectors.
///
/// Mismatched lengths are an error; a zero-norm vector yields `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        bail!(
            "embedding vectors must have the same length ({} vs {})",
            a.len(),
            b.len()
        );
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / denom)
}

/// Cosine distance `1 - cos`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    Ok(1.0 - cosine_similarity(a, b)?)
}

/// Component-wise mean. Errors on an empty set or ragged input.
pub fn centroid<V: AsRef<[f32]>>(vectors: &[V]) -> Result<Vec<f32>> {
    let Some(first) = vectors.first() else {
        bail!("centroid of an empty vector set");
    };
    let dims = first.as_ref().len();
    let mut acc = vec![0.0f32; dims];
    for v in vectors {
        let v = v.as_ref();
        if v.len() != dims {
            bail!("ragged vector set ({} vs {dims})", v.len());
        }
        for (a, x) in acc.iter_mut().zip(v) {
            *a += x;
        }
    }
    let n = vectors.len() as f32;
    for a in acc.iter_mut() {
        *a /= n;
    }
    Ok(acc)
}

/// Mean cosine similarity of each member to `center`.
pub fn cohesion<V: AsRef<[f32]>>(vectors: &[V], center: &[f32]) -> Result<f32> {
    if vectors.is_empty() {
        bail!("cohesion of an empty vector set");
    }
    let mut sum = 0.0f32;
    for v in vectors {
        sum += cosine_similarity(v.as_ref(), center)?;
    }
    Ok(sum / vectors.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_and_orthogonal() {
        let a = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap(), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_zero_similarity() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).unwrap(), 0.0);
    }

    #[test]
    fn length_mismatch_is_an_error() {
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_err());
    }

    #[test]
    fn centroid_and_cohesion() {
        let vs: Vec<Vec<f32>> = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let c = centroid(&vs).unwrap();
        assert_eq!(c, vec![0.5, 0.5]);
        let coh = cohesion(&vs, &c).unwrap();
        assert!((coh - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);

        let empty: Vec<Vec<f32>> = vec![];
        assert!(centroid(&empty).is_err());
        assert!(centroid(&[vec![1.0f32], vec![1.0f32, 2.0]]).is_err());
    }
}
