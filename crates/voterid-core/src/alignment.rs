//! Five-point face alignment for the recognizer.
//!
//! Fits a least-squares similarity transform (scale, rotation, translation)
//! from detected landmarks to the InsightFace reference layout and warps the
//! face into a 112×112 RGB crop.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Landmark spread (sum of squared distances from the centroid, px²) below
/// which the geometry is considered degenerate.
const MIN_LANDMARK_SPREAD: f32 = 1.0;

/// Least-squares similarity transform mapping `src` onto `dst`.
///
/// Returns `[a, -b, tx, b, a, ty]`, i.e.
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
/// or `None` when the source points collapse onto (nearly) one point.
fn estimate_similarity_transform(
    src: &[(f32, f32); 5],
    dst: &[(f32, f32); 5],
) -> Option<[f32; 6]> {
    let n = src.len() as f32;
    let centroid = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (smx, smy) = centroid(src);
    let (dmx, dmy) = centroid(dst);

    let mut spread = 0.0f32;
    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - smx, sy - smy);
        let (dx, dy) = (dx - dmx, dy - dmy);
        spread += sx * sx + sy * sy;
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
    }

    if spread < MIN_LANDMARK_SPREAD {
        return None;
    }

    let a = dot / spread;
    let b = cross / spread;
    let tx = dmx - (a * smx - b * smy);
    let ty = dmy - (b * smx + a * smy);

    Some([a, -b, tx, b, a, ty])
}

/// Warp `image` through the inverse of `matrix` into an `out_size`² RGB crop.
///
/// Bilinear sampling per channel; samples outside the source read as black.
fn warp_affine(image: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let [a, _, tx, b, _, ty] = *matrix;
    let (src_w, src_h) = (image.width() as i64, image.height() as i64);

    // M = [[a, -b], [b, a]]; det = a² + b²
    let det = a * a + b * b;
    if det < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let ia = a / det;
    let ib = b / det;

    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < src_w && y >= 0 && y < src_h {
            image.get_pixel(x as u32, y as u32).0.map(f32::from)
        } else {
            [0.0; 3]
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut px = [0u8; 3];
        for c in 0..3 {
            let v = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

/// Align a face to the canonical 112×112 ArcFace crop from its five landmarks.
///
/// Returns `None` if the landmarks are degenerate (all on top of each other).
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112)?;
    Some(warp_affine(image, &matrix, ALIGNED_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts).unwrap();
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        for (got, want) in m.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "{m:?}");
        }
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → a ≈ 0.5, no rotation
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
        assert!(m[3].abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_translated_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x + 30.0, y - 12.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((m[2] + 30.0).abs() < 1e-2, "tx = {}", m[2]);
        assert!((m[5] - 12.0).abs() < 1e-2, "ty = {}", m[5]);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let collapsed = [(50.0, 50.0); 5];
        assert!(estimate_similarity_transform(&collapsed, &REFERENCE_LANDMARKS_112).is_none());
        let image = RgbImage::new(100, 100);
        assert!(align_face(&image, &collapsed).is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        // A bright patch at the left eye must end up near the reference left eye.
        let mut image = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                image.put_pixel(x, y, Rgb([255, 0, 255]));
            }
        }

        let aligned = align_face(&image, &src).unwrap();
        let (rx, ry) = REFERENCE_LANDMARKS_112[0];
        let (rx, ry) = (rx.round() as u32, ry.round() as u32);
        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap();
        assert!(brightest > 100, "left eye patch missing near ({rx}, {ry}): {brightest}");
        // Channels are warped independently.
        assert_eq!(aligned.get_pixel(rx, ry).0[1], 0);
    }
}
