//! Lightcurve assembly.
//!
//! A [`Lightcurve`] wraps the deduplicated, cadence-ascending point series of
//! one record. It exposes the series as parallel arrays, contiguous cadence
//! windows, and "fancy indexing" by an arbitrary cadence list, and supports
//! overwriting one field for a cadence set and merging incoming batches.
//!
//! Invariant: `points` is strictly ascending by cadence at all times.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use serde::Serialize;

use crate::error::{ArchiveError, Result};
use crate::models::{Point, QualityFlags};

// ---

/// Addressable point fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Time,
    Value,
    Error,
    XPosition,
    YPosition,
    Quality,
}

impl Field {
    /// Resolve a field name or one of its common aliases (case-insensitive).
    pub fn from_alias(name: &str) -> Option<Field> {
        // ---
        let field = match name.to_ascii_lowercase().as_str() {
            "time" | "bjd" | "barycentric_julian_date" => Field::Time,
            "value" | "values" | "flux" | "mag" | "magnitude" | "data" => Field::Value,
            "error" | "errors" | "err" | "fluxerr" | "flux_err" | "magerr" | "mag_err"
            | "magnitude_err" | "magnitudeerror" => Field::Error,
            "x" | "x_position" | "x_centroid" | "x_centroids" => Field::XPosition,
            "y" | "y_position" | "y_centroid" | "y_centroids" => Field::YPosition,
            "quality" | "quality_flag" | "quality_flags" => Field::Quality,
            _ => return None,
        };
        Some(field)
    }
}

/// Replacement values for one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValues {
    Time(Vec<f64>),
    Value(Vec<f64>),
    Error(Vec<f64>),
    XPosition(Vec<f64>),
    YPosition(Vec<f64>),
    Quality(Vec<QualityFlags>),
}

impl FieldValues {
    pub fn len(&self) -> usize {
        match self {
            FieldValues::Time(v)
            | FieldValues::Value(v)
            | FieldValues::Error(v)
            | FieldValues::XPosition(v)
            | FieldValues::YPosition(v) => v.len(),
            FieldValues::Quality(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field(&self) -> Field {
        match self {
            FieldValues::Time(_) => Field::Time,
            FieldValues::Value(_) => Field::Value,
            FieldValues::Error(_) => Field::Error,
            FieldValues::XPosition(_) => Field::XPosition,
            FieldValues::YPosition(_) => Field::YPosition,
            FieldValues::Quality(_) => Field::Quality,
        }
    }

    /// Write the `i`th value into `point`.
    fn apply(&self, i: usize, point: &mut Point) {
        match self {
            FieldValues::Time(v) => point.time = v[i],
            FieldValues::Value(v) => point.value = v[i],
            FieldValues::Error(v) => point.error = v[i],
            FieldValues::XPosition(v) => point.x_position = v[i],
            FieldValues::YPosition(v) => point.y_position = v[i],
            FieldValues::Quality(v) => point.quality = v[i],
        }
    }
}

/// Parallel, equal-length, cadence-ordered field arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LightcurveArrays {
    pub cadences: Vec<i64>,
    pub times: Vec<f64>,
    pub values: Vec<f64>,
    pub errors: Vec<f64>,
    pub x_positions: Vec<f64>,
    pub y_positions: Vec<f64>,
    pub quality_flags: Vec<QualityFlags>,
}

impl LightcurveArrays {
    pub fn len(&self) -> usize {
        self.cadences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cadences.is_empty()
    }
}

impl<'a> FromIterator<&'a Point> for LightcurveArrays {
    fn from_iter<I: IntoIterator<Item = &'a Point>>(iter: I) -> Self {
        // ---
        let mut arrays = LightcurveArrays::default();
        for p in iter {
            arrays.cadences.push(p.cadence);
            arrays.times.push(p.time);
            arrays.values.push(p.value);
            arrays.errors.push(p.error);
            arrays.x_positions.push(p.x_position);
            arrays.y_positions.push(p.y_position);
            arrays.quality_flags.push(p.quality);
        }
        arrays
    }
}

/// Cadence-unique, cadence-ascending point series of one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lightcurve {
    points: Vec<Point>,
}

impl Lightcurve {
    /// Build from points that are already deduplicated and ascending, as
    /// returned by a store read.
    pub(crate) fn from_sorted(points: Vec<Point>) -> Self {
        debug_assert!(points.windows(2).all(|w| w[0].cadence < w[1].cadence));
        Self { points }
    }

    /// Build from an arbitrary batch. Later entries win on repeated cadences.
    pub fn from_points(points: Vec<Point>) -> Self {
        let mut lc = Self::default();
        lc.merge([points]);
        lc
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    pub fn cadences(&self) -> Vec<i64> {
        self.points.iter().map(|p| p.cadence).collect()
    }

    pub fn get(&self, cadence: i64) -> Option<&Point> {
        self.position(cadence).map(|i| &self.points[i])
    }

    /// Full-field read as parallel arrays.
    pub fn arrays(&self) -> LightcurveArrays {
        self.points.iter().collect()
    }

    /// Contiguous slice of the points whose cadence lies in `range`.
    pub fn window(&self, range: RangeInclusive<i64>) -> &[Point] {
        // ---
        let start = self.points.partition_point(|p| p.cadence < *range.start());
        let end = self.points.partition_point(|p| p.cadence <= *range.end());
        if start >= end {
            return &[];
        }
        &self.points[start..end]
    }

    /// Points for the requested cadences, in request order.
    ///
    /// Cadences missing from the series are skipped. A cadence requested
    /// twice produces two output points.
    pub fn select(&self, cadences: &[i64]) -> Vec<Point> {
        cadences.iter().filter_map(|c| self.get(*c).copied()).collect()
    }

    /// [`Lightcurve::select`] rendered as parallel arrays.
    pub fn select_arrays(&self, cadences: &[i64]) -> LightcurveArrays {
        cadences.iter().filter_map(|c| self.get(*c)).collect()
    }

    /// Overwrite one field for the given cadences.
    ///
    /// `values[i]` is written to the point at `cadences[i]`. Cadences absent
    /// from the series are skipped. The lengths are checked before anything
    /// is written, so a mismatch leaves the series untouched. Returns the
    /// number of points written.
    pub fn assign(&mut self, cadences: &[i64], values: &FieldValues) -> Result<usize> {
        // ---
        if cadences.len() != values.len() {
            return Err(ArchiveError::LengthMismatch {
                keys: cadences.len(),
                values: values.len(),
            });
        }

        let mut written = 0;
        for (i, cadence) in cadences.iter().enumerate() {
            if let Some(pos) = self.position(*cadence) {
                values.apply(i, &mut self.points[pos]);
                written += 1;
            }
        }
        Ok(written)
    }

    /// Merge incoming batches into the series.
    ///
    /// Incoming points replace existing points at the same cadence; new
    /// cadences are added. Batches are applied in order, so a later batch
    /// wins over an earlier one. The result stays cadence-unique and
    /// ascending. Returns the number of points in the merged series.
    pub fn merge<I, B>(&mut self, batches: I) -> usize
    where
        I: IntoIterator<Item = B>,
        B: IntoIterator<Item = Point>,
    {
        // ---
        let mut by_cadence: BTreeMap<i64, Point> =
            self.points.drain(..).map(|p| (p.cadence, p)).collect();
        for batch in batches {
            for point in batch {
                by_cadence.insert(point.cadence, point);
            }
        }
        self.points = by_cadence.into_values().collect();
        self.points.len()
    }

    /// Points whose quality bit 0 is clear.
    pub fn good_points(&self) -> impl Iterator<Item = &Point> {
        self.points.iter().filter(|p| p.quality.is_ok())
    }

    fn position(&self, cadence: i64) -> Option<usize> {
        self.points.binary_search_by_key(&cadence, |p| p.cadence).ok()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    /// Record holding cadences {1, 2, 10, 20, 100, 200} with value = cadence.
    fn sample() -> Lightcurve {
        Lightcurve::from_points(
            [200, 1, 20, 2, 100, 10]
                .iter()
                .map(|c| Point::at(*c).with_value(*c as f64))
                .collect(),
        )
    }

    fn cadences_of(points: &[Point]) -> Vec<i64> {
        points.iter().map(|p| p.cadence).collect()
    }

    #[test]
    fn test_points_are_sorted_on_construction() {
        // ---
        assert_eq!(sample().cadences(), vec![1, 2, 10, 20, 100, 200]);
    }

    #[test]
    fn test_select_omits_missing_cadences() {
        // ---
        let selected = sample().select(&[1, 2, 3, 10]);
        assert_eq!(cadences_of(&selected), vec![1, 2, 10]);
    }

    #[test]
    fn test_select_preserves_request_order() {
        // ---
        let selected = sample().select(&[10, 1]);
        assert_eq!(cadences_of(&selected), vec![10, 1]);
    }

    #[test]
    fn test_select_repeats_duplicated_keys() {
        // ---
        let arrays = sample().select_arrays(&[20, 20, 5, 1]);
        assert_eq!(arrays.cadences, vec![20, 20, 1]);
        assert_eq!(arrays.values, vec![20.0, 20.0, 1.0]);
    }

    #[test]
    fn test_arrays_are_parallel() {
        // ---
        let arrays = sample().arrays();
        assert_eq!(arrays.len(), 6);
        assert_eq!(arrays.times.len(), 6);
        assert_eq!(arrays.values.len(), 6);
        assert_eq!(arrays.errors.len(), 6);
        assert_eq!(arrays.x_positions.len(), 6);
        assert_eq!(arrays.y_positions.len(), 6);
        assert_eq!(arrays.quality_flags.len(), 6);
        assert_eq!(arrays.values, vec![1.0, 2.0, 10.0, 20.0, 100.0, 200.0]);
    }

    #[test]
    fn test_window_is_contiguous() {
        // ---
        let lc = sample();
        assert_eq!(cadences_of(lc.window(2..=100)), vec![2, 10, 20, 100]);
        assert_eq!(cadences_of(lc.window(3..=9)), Vec::<i64>::new());
        assert_eq!(cadences_of(lc.window(150..=1000)), vec![200]);
        assert!(lc.window(50..=40).is_empty());
    }

    #[test]
    fn test_assign_length_mismatch_leaves_values() {
        // ---
        let mut lc = sample();
        let before = lc.clone();
        let err = lc
            .assign(&[1, 2, 10], &FieldValues::Value(vec![0.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::LengthMismatch { keys: 3, values: 2 }));
        assert_eq!(lc, before);
    }

    #[test]
    fn test_assign_touches_only_addressed_field() {
        // ---
        let mut lc = sample();
        let written = lc
            .assign(&[10, 1, 7], &FieldValues::Error(vec![0.5, 0.25, 9.0]))
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(lc.get(10).unwrap().error, 0.5);
        assert_eq!(lc.get(1).unwrap().error, 0.25);
        assert_eq!(lc.get(10).unwrap().value, 10.0);
        assert_eq!(lc.get(2).unwrap().error, 0.0);
        assert_eq!(lc.len(), 6);
    }

    #[test]
    fn test_assign_quality() {
        // ---
        let mut lc = sample();
        lc.assign(&[2], &FieldValues::Quality(vec![QualityFlags::BAD]))
            .unwrap();
        assert_eq!(lc.good_points().count(), 5);
    }

    #[test]
    fn test_merge_overwrites_and_appends() {
        // ---
        let mut lc = sample();
        let len = lc.merge([
            vec![Point::at(10).with_value(-1.0), Point::at(15).with_value(15.0)],
            vec![Point::at(15).with_value(-15.0), Point::at(0).with_value(0.0)],
        ]);
        assert_eq!(len, 8);
        assert_eq!(lc.cadences(), vec![0, 1, 2, 10, 15, 20, 100, 200]);
        assert_eq!(lc.get(10).unwrap().value, -1.0);
        assert_eq!(lc.get(15).unwrap().value, -15.0);
    }

    #[test]
    fn test_field_aliases() {
        // ---
        assert_eq!(Field::from_alias("FLUX"), Some(Field::Value));
        assert_eq!(Field::from_alias("mag_err"), Some(Field::Error));
        assert_eq!(Field::from_alias("x"), Some(Field::XPosition));
        assert_eq!(Field::from_alias("bjd"), Some(Field::Time));
        assert_eq!(Field::from_alias("quality_flag"), Some(Field::Quality));
        assert_eq!(Field::from_alias("bogus"), None);
        assert_eq!(FieldValues::YPosition(vec![]).field(), Field::YPosition);
    }
}
