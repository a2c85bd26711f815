use std::cmp::Ordering;

/// Axis-aligned rectangle in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// The x-coordinate of the top-left corner.
    pub x: f32,
    /// The y-coordinate of the top-left corner.
    pub y: f32,
    /// The width of the box.
    pub width: f32,
    /// The height of the box.
    pub height: f32,
}

/// Integer pixel region fully inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Calculates the area of the bounding box.
    pub fn area(&self) -> f32 {
        (self.width.max(0.0)) * (self.height.max(0.0))
    }

    /// Area shared with `other`; zero when they do not overlap.
    pub fn intersection_area(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Calculates the Intersection over Union (IoU) with another bounding box.
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection_area(other);
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Divide every coordinate by `factor`.
    pub fn scaled_down(&self, factor: f32) -> Self {
        Self::new(
            self.x / factor,
            self.y / factor,
            self.width / factor,
            self.height / factor,
        )
    }

    /// Round to whole pixels and intersect with a `cols x rows` image.
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn to_pixel_rect(&self, cols: usize, rows: usize) -> Option<PixelRect> {
        let x0 = self.x.round();
        let y0 = self.y.round();
        let x1 = (x0 + self.width.round()).min(cols as f32);
        let y1 = (y0 + self.height.round()).min(rows as f32);
        let x0 = x0.max(0.0);
        let y0 = y0.max(0.0);
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        Some(PixelRect {
            x: x0 as usize,
            y: y0 as usize,
            width: (x1 - x0) as usize,
            height: (y1 - y0) as usize,
        })
    }
}

/// A candidate face: a box and the score of the last stage it passed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub face: BoundingBox,
    pub score: f32,
}

impl Detection {
    pub fn new(face: BoundingBox, score: f32) -> Self {
        Self { face, score }
    }
}

/// Greedy non-maximum suppression.
///
/// Detections are stably sorted by descending score; walking that order, a detection is dropped
/// when its IoU with any detection already kept reaches `threshold`.
pub fn nms(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for detection in detections {
        let suppressed = kept
            .iter()
            .any(|winner| winner.face.iou(&detection.face) >= threshold);
        if !suppressed {
            kept.push(detection);
        }
    }
    kept
}

/// Map detections found on a level resized by `factor` back to source-image coordinates.
pub fn back_project(detections: &mut [Detection], factor: f32) {
    for detection in detections {
        detection.face = detection.face.scaled_down(factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-6;

    fn det(x: f32, y: f32, w: f32, h: f32, score: f32) -> Detection {
        Detection::new(BoundingBox::new(x, y, w, h), score)
    }

    #[test]
    fn iou_basic_properties() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 5.0, 10.0, 10.0);
        let far = BoundingBox::new(20.0, 20.0, 3.0, 3.0);
        assert!((a.iou(&a) - 1.0).abs() < EPS);
        assert!((a.iou(&b) - b.iou(&a)).abs() < EPS);
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < EPS);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn touching_boxes_do_not_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 4.0, 4.0);
        let b = BoundingBox::new(4.0, 0.0, 4.0, 4.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn nms_respects_threshold() {
        let detections = vec![det(5.0, 5.0, 10.0, 10.0, 0.6), det(0.0, 0.0, 10.0, 10.0, 0.9)];

        let kept = nms(detections.clone(), 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);

        let kept = nms(detections, 0.1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn suppressed_detections_do_not_suppress_others() {
        // b overlaps a heavily and c overlaps b heavily, but c and a are disjoint.
        let a = det(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = det(4.0, 0.0, 10.0, 10.0, 0.8);
        let c = det(10.0, 0.0, 10.0, 10.0, 0.7);
        let kept = nms(vec![c, b, a], 0.3);
        assert_eq!(kept, vec![a, c]);
    }

    #[test]
    fn nms_is_idempotent() {
        let detections = vec![
            det(1.0, 1.0, 5.0, 5.0, 0.55),
            det(2.0, 3.0, 7.0, 7.0, 0.34),
            det(4.0, 3.0, 6.0, 6.0, 0.98),
            det(5.0, 5.0, 2.0, 2.0, 0.86),
            det(6.0, 4.0, 6.0, 5.0, 1.0),
        ];
        let once = nms(detections, 0.2);
        let twice = nms(once.clone(), 0.2);
        assert_eq!(once, twice);
    }

    #[test]
    fn back_projection_divides_geometry() {
        let mut detections = vec![det(6.0, 12.0, 3.0, 3.0, 0.7)];
        back_project(&mut detections, 0.25);
        assert_eq!(detections[0].face, BoundingBox::new(24.0, 48.0, 12.0, 12.0));
        assert_eq!(detections[0].score, 0.7);
    }

    #[test]
    fn pixel_rect_rounds_and_clips() {
        let face = BoundingBox::new(-2.4, 3.6, 10.2, 4.0);
        assert_eq!(
            face.to_pixel_rect(6, 6),
            Some(PixelRect {
                x: 0,
                y: 4,
                width: 6,
                height: 2
            })
        );
        assert_eq!(BoundingBox::new(7.0, 0.0, 2.0, 2.0).to_pixel_rect(6, 6), None);
        assert_eq!(BoundingBox::new(1.0, 1.0, 0.2, 3.0).to_pixel_rect(6, 6), None);
    }
}
