// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Affine coordinate transformation applied to exported geometry.

use citydb_lite_core::{
    AffineMatrix, Envelope, Feature, FeatureRef, Geometry, GeometryMember, Point,
};
use nalgebra::{Matrix4, Point3};

/// 3x4 affine transform stored as a homogeneous 4x4 matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    matrix: Matrix4<f64>,
}

impl AffineTransform {
    /// Builds the transform from a row-major 3x4 matrix.
    pub fn from_rows(rows: &AffineMatrix) -> Self {
        let r = rows;
        Self {
            matrix: Matrix4::new(
                r[0][0], r[0][1], r[0][2], r[0][3], //
                r[1][0], r[1][1], r[1][2], r[1][3], //
                r[2][0], r[2][1], r[2][2], r[2][3], //
                0.0, 0.0, 0.0, 1.0,
            ),
        }
    }

    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    pub fn translation(dx: f64, dy: f64, dz: f64) -> Self {
        Self::from_rows(&[
            [1.0, 0.0, 0.0, dx],
            [0.0, 1.0, 0.0, dy],
            [0.0, 0.0, 1.0, dz],
        ])
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn apply_point(&self, p: &Point) -> Point {
        let t = self.matrix.transform_point(&Point3::new(p[0], p[1], p[2]));
        [t.x, t.y, t.z]
    }

    /// Box around the transformed corners.
    pub fn apply_envelope(&self, envelope: &Envelope) -> Envelope {
        let corners = envelope.corners().map(|c| self.apply_point(&c));
        let mut out = Envelope::from_point(corners[0]);
        for c in &corners[1..] {
            out.include(c);
        }
        out
    }

    pub fn apply_geometry(&self, geometry: &mut Geometry) {
        geometry.for_each_polygon_mut(&mut |polygon| {
            for p in polygon.points_mut() {
                *p = self.apply_point(p);
            }
        });
    }

    /// Transforms every inline geometry of a feature tree.
    pub fn apply_feature(&self, feature: &mut Feature) {
        for g in &mut feature.geometries {
            if let GeometryMember::Inline(geometry) = &mut g.geometry {
                self.apply_geometry(geometry);
            }
        }
        for child in &mut feature.children {
            if let FeatureRef::Inline(c) = &mut child.target {
                self.apply_feature(c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use citydb_lite_core::{FeatureType, GeometryKind, Lod, Polygon, Representation};

    #[test]
    fn rotation_and_translation() {
        // 90 degrees about z, then +10 in x
        let t = AffineTransform::from_rows(&[
            [0.0, -1.0, 0.0, 10.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ]);
        let p = t.apply_point(&[1.0, 0.0, 5.0]);
        assert_relative_eq!(p[0], 10.0);
        assert_relative_eq!(p[1], 1.0);
        assert_relative_eq!(p[2], 5.0);

        let env = t.apply_envelope(&Envelope::new([0.0, 0.0, 0.0], [2.0, 1.0, 1.0]));
        assert_relative_eq!(env.min[0], 9.0);
        assert_relative_eq!(env.max[0], 10.0);
        assert_relative_eq!(env.max[1], 2.0);
    }

    #[test]
    fn feature_tree_is_transformed() {
        let square = Polygon::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]]);
        let roof = Feature::new(FeatureType::RoofSurface).with_geometry(
            Lod::Lod2,
            Representation::MultiSurface,
            Geometry::new(GeometryKind::MultiSurface(vec![Geometry::polygon(square.clone()).into()])),
        );
        let mut building = Feature::new(FeatureType::Building)
            .with_geometry(Lod::Lod1, Representation::Solid, Geometry::polygon(square))
            .with_child("boundedBy", roof);
        AffineTransform::translation(0.0, 0.0, 3.0).apply_feature(&mut building);

        let env = building.envelope().unwrap();
        assert_relative_eq!(env.min[2], 3.0);
        assert_relative_eq!(env.max[2], 3.0);
        assert_eq!(AffineTransform::identity().apply_point(&[1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
    }
}
