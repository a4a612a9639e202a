//! Elliptical approximation of polygons.
//!
//! Change-detection layers are drawn as ellipses: each polygon is replaced by
//! the ellipse inscribed in its minimum-area bounding rectangle.

use std::f64::consts::TAU;

use geo::{Coord, Geometry, GeometryCollection, LineString, MinimumRotatedRect, MultiPolygon, Polygon};

/// Edges shorter than this make the rectangle degenerate.
const MIN_EDGE: f64 = 1e-12;

pub const DEFAULT_ELLIPSE_POINTS: usize = 64;

/// Replace `polygon` with an ellipse sampled at `points` vertices (ring closed).
///
/// The ellipse is centred on the polygon's minimum rotated rectangle, with
/// semi-axes of half the rectangle's edge lengths along the edge directions.
/// A polygon whose rectangle collapses to a line or point is returned unchanged.
#[must_use]
pub fn ellipse_from_polygon(polygon: &Polygon<f64>, points: usize) -> Polygon<f64> {
    let Some(rect) = polygon.minimum_rotated_rect() else {
        return polygon.clone();
    };
    let corners: Vec<Coord<f64>> = rect.exterior().coords().copied().collect();
    if corners.len() < 4 || points < 3 {
        return polygon.clone();
    }

    let e1 = corners[1] - corners[0];
    let e2 = corners[3] - corners[0];
    let len1 = e1.x.hypot(e1.y);
    let len2 = e2.x.hypot(e2.y);
    if len1 < MIN_EDGE || len2 < MIN_EDGE {
        return polygon.clone();
    }

    let center = Coord {
        x: (corners[0].x + corners[2].x) / 2.0,
        y: (corners[0].y + corners[2].y) / 2.0,
    };
    let (u1, u2) = (e1 / len1, e2 / len2);
    let (a, b) = (len1 / 2.0, len2 / 2.0);

    let mut ring: Vec<Coord<f64>> = (0..points)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = TAU * i as f64 / points as f64;
            let (sin, cos) = t.sin_cos();
            center + u1 * (a * cos) + u2 * (b * sin)
        })
        .collect();
    ring.push(ring[0]);
    Polygon::new(LineString::from(ring), vec![])
}

/// Apply [`ellipse_from_polygon`] to every polygon of a geometry, descending
/// into multipolygons and geometry collections; other geometry types pass through.
#[must_use]
pub fn ellipsize(geometry: Geometry<f64>, points: usize) -> Geometry<f64> {
    match geometry {
        Geometry::Polygon(p) => Geometry::Polygon(ellipse_from_polygon(&p, points)),
        Geometry::MultiPolygon(mp) => Geometry::MultiPolygon(MultiPolygon::new(
            mp.0.iter().map(|p| ellipse_from_polygon(p, points)).collect(),
        )),
        Geometry::GeometryCollection(gc) => Geometry::GeometryCollection(GeometryCollection::new_from(
            gc.0.into_iter().map(|g| ellipsize(g, points)).collect(),
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area, Centroid};

    fn rectangle() -> Polygon<f64> {
        polygon![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 2.0), (x: 0.0, y: 2.0), (x: 0.0, y: 0.0)]
    }

    #[test]
    fn test_rectangle_becomes_inscribed_ellipse() {
        let ellipse = ellipse_from_polygon(&rectangle(), 64);
        assert_eq!(ellipse.exterior().0.len(), 65);
        assert_eq!(ellipse.exterior().0.first(), ellipse.exterior().0.last());

        let c = ellipse.centroid().unwrap();
        assert!((c.x() - 2.0).abs() < 1e-9);
        assert!((c.y() - 1.0).abs() < 1e-9);

        // polygon area of a 64-gon inscribed in an ellipse with a=2, b=1
        let expected = std::f64::consts::PI * 2.0 * (TAU / 64.0).sin() / (TAU / 64.0);
        assert!((ellipse.unsigned_area() - expected).abs() < 1e-6);

        for p in ellipse.exterior().coords() {
            let v = ((p.x - 2.0) / 2.0).powi(2) + (p.y - 1.0).powi(2);
            assert!((v - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_deterministic() {
        let poly = polygon![(x: 1.0, y: 1.0), (x: 5.0, y: 2.0), (x: 4.0, y: 6.0), (x: 0.5, y: 3.0), (x: 1.0, y: 1.0)];
        assert_eq!(ellipse_from_polygon(&poly, 32), ellipse_from_polygon(&poly, 32));
    }

    #[test]
    fn test_degenerate_passes_through() {
        let line = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0), (x: 2.0, y: 2.0), (x: 0.0, y: 0.0)];
        assert_eq!(ellipse_from_polygon(&line, 64), line);
    }

    #[test]
    fn test_multipolygon_members_and_passthrough() {
        let mp = Geometry::MultiPolygon(MultiPolygon::new(vec![rectangle(), rectangle()]));
        let Geometry::MultiPolygon(out) = ellipsize(mp, 16) else {
            panic!("expected multipolygon");
        };
        assert_eq!(out.0.len(), 2);
        assert!(out.0.iter().all(|p| p.exterior().0.len() == 17));

        let point = Geometry::Point(geo::Point::new(1.0, 2.0));
        assert_eq!(ellipsize(point.clone(), 16), point);
    }

    #[test]
    fn test_collection_members_recursed() {
        let point = Geometry::Point(geo::Point::new(1.0, 2.0));
        let nested = Geometry::GeometryCollection(GeometryCollection::new_from(vec![Geometry::MultiPolygon(
            MultiPolygon::new(vec![rectangle()]),
        )]));
        let gc = Geometry::GeometryCollection(GeometryCollection::new_from(vec![
            Geometry::Polygon(rectangle()),
            point.clone(),
            nested,
        ]));

        let Geometry::GeometryCollection(out) = ellipsize(gc, 16) else {
            panic!("expected geometry collection");
        };
        assert_eq!(out.0.len(), 3);
        let Geometry::Polygon(ellipse) = &out.0[0] else {
            panic!("expected polygon");
        };
        assert_eq!(ellipse.exterior().0.len(), 17);
        assert_eq!(out.0[1], point);
        let Geometry::GeometryCollection(inner) = &out.0[2] else {
            panic!("expected nested collection");
        };
        let Geometry::MultiPolygon(mp) = &inner.0[0] else {
            panic!("expected multipolygon");
        };
        assert_eq!(mp.0[0].exterior().0.len(), 17);
    }
}
