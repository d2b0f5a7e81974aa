//! Embedding vector helpers.
//!
//! Embeddings are persisted as raw little-endian IEEE-754 float32 bytes and
//! L2-normalized before storage, so similarity is a plain dot product.

/// Converts a float vector to raw bytes (4 bytes per float, little-endian).
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &val in vector {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Converts raw little-endian bytes back to a float vector.
/// Trailing bytes that do not fill a whole float are ignored.
pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// L2-normalizes a vector in place so its magnitude is 1.0.
///
/// The zero vector (magnitude below 1e-10) is left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let mut sum_of_squares = 0.0f64;
    for &v in vector.iter() {
        sum_of_squares += v as f64 * v as f64;
    }
    let magnitude = sum_of_squares.sqrt();
    if magnitude < 1e-10 {
        return;
    }
    for v in vector.iter_mut() {
        *v = (*v as f64 / magnitude) as f32;
    }
}

/// Dot product of two vectors, accumulated in f64.
///
/// For unit vectors this equals the cosine similarity, in range [-1, 1].
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    let len = a.len().min(b.len());
    let mut sum = 0.0f64;
    for i in 0..len {
        sum += a[i] as f64 * b[i] as f64;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let v = vec![0.1f32, -2.5, 3.75, 0.0, f32::MIN_POSITIVE, 1e20];
        let bytes = vector_to_bytes(&v);
        assert_eq!(bytes.len(), v.len() * 4);
        assert_eq!(bytes_to_vector(&bytes), v);
    }

    #[test]
    fn test_bytes_ignores_partial_tail() {
        let mut bytes = vector_to_bytes(&[1.0, 2.0]);
        bytes.push(0xFF);
        assert_eq!(bytes_to_vector(&bytes), vec![1.0, 2.0]);
    }

    #[test]
    fn test_normalize_unit_magnitude() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        let norm = dot(&v, &v).sqrt();
        assert!((norm - 1.0).abs() < 1e-6, "norm was {}", norm);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_is_fixed_point() {
        let mut v = vec![0.2f32, -0.7, 1.3, 0.05];
        l2_normalize(&mut v);
        let once = v.clone();
        l2_normalize(&mut v);
        for (a, b) in once.iter().zip(v.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_normalize_zero_vector_untouched() {
        let mut v = vec![0.0f32; 8];
        l2_normalize(&mut v);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_dot_bounds_for_unit_vectors() {
        let mut a = vec![0.3f32, -0.9, 0.11, 2.0];
        let mut b = vec![-1.0f32, 0.4, 0.4, 0.5];
        l2_normalize(&mut a);
        l2_normalize(&mut b);
        let s = dot(&a, &b);
        assert!(s >= -1.0 - 1e-4 && s <= 1.0 + 1e-4);
        // Self-similarity of a unit vector is 1.
        assert!((dot(&a, &a) - 1.0).abs() < 1e-4);
    }
}
