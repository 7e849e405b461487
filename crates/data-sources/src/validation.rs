//! Per-variant validity predicates for example fragments.
//!
//! Every float field must be finite. Station yields must be non-negative and
//! optical-flow data must not contain the out-of-frame sentinel.

use nowcasting_common::{ArrayData, Example, NowcastingError, NowcastingResult};

use crate::types::SourceKind;

/// Value marking an optical-flow pixel whose source fell outside the frame.
pub const OPTICAL_FLOW_SENTINEL: f32 = -1.0;

/// Validate every field of a fragment produced by `kind`.
pub fn validate_fragment(kind: SourceKind, example: &Example) -> NowcastingResult<()> {
    for (name, array) in &example.fields {
        check_finite(kind, name, &array.data)?;
    }

    let data_field = kind.field_names().data;
    match kind {
        SourceKind::Pv | SourceKind::Gsp => {
            if let Some(values) = example.field(data_field).and_then(|a| a.as_f32()) {
                if let Some(v) = values.iter().find(|v| **v < 0.0) {
                    return Err(NowcastingError::validation(
                        kind.as_str(),
                        data_field,
                        format!("negative power value {}", v),
                    ));
                }
            }
        }
        SourceKind::OpticalFlow => {
            if let Some(values) = example.field(data_field).and_then(|a| a.as_f32()) {
                let count = values.iter().filter(|v| **v == OPTICAL_FLOW_SENTINEL).count();
                if count > 0 {
                    return Err(NowcastingError::validation(
                        kind.as_str(),
                        data_field,
                        format!("{} pixels carry the out-of-frame sentinel", count),
                    ));
                }
            }
        }
        SourceKind::Satellite | SourceKind::Nwp => {}
    }
    Ok(())
}

fn check_finite(kind: SourceKind, field: &str, data: &ArrayData) -> NowcastingResult<()> {
    let (nan, inf) = match data {
        ArrayData::Float32(v) => (
            v.iter().any(|x| x.is_nan()),
            v.iter().any(|x| x.is_infinite()),
        ),
        ArrayData::Float64(v) => (
            v.iter().any(|x| x.is_nan()),
            v.iter().any(|x| x.is_infinite()),
        ),
        ArrayData::Int32(_) | ArrayData::Int64(_) => (false, false),
    };
    if nan {
        return Err(NowcastingError::validation(kind.as_str(), field, "contains NaN"));
    }
    if inf {
        return Err(NowcastingError::validation(kind.as_str(), field, "contains infinity"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nowcasting_common::{FieldArray, Location};
    use test_utils::reference_start;

    fn fragment(field: &str, values: Vec<f32>) -> Example {
        Example::new(reference_start(), Location::new(0.0, 0.0))
            .with_field(field, FieldArray::vector_f32("time", values))
            .unwrap()
    }

    #[test]
    fn test_finite_fields_pass() {
        let example = fragment("sat_data", vec![0.1, 0.2]);
        assert!(validate_fragment(SourceKind::Satellite, &example).is_ok());
    }

    #[test]
    fn test_nan_and_infinity_fail() {
        let example = fragment("nwp", vec![0.1, f32::NAN]);
        let err = validate_fragment(SourceKind::Nwp, &example).unwrap_err();
        assert!(matches!(
            err,
            NowcastingError::DataValidation { ref data_source, ref field, .. }
                if data_source == "nwp" && field == "nwp"
        ));

        let example = fragment("sat_data", vec![f32::INFINITY]);
        assert!(validate_fragment(SourceKind::Satellite, &example).is_err());
    }

    #[test]
    fn test_negative_yield_fails() {
        let example = fragment("pv_yield", vec![0.0, -0.5]);
        assert!(validate_fragment(SourceKind::Pv, &example).is_err());

        // The same values are fine for a grid source.
        let example = fragment("sat_data", vec![0.0, -0.5]);
        assert!(validate_fragment(SourceKind::Satellite, &example).is_ok());
    }

    #[test]
    fn test_optical_flow_sentinel_fails() {
        let example = fragment("opticalflow_data", vec![0.3, OPTICAL_FLOW_SENTINEL]);
        assert!(validate_fragment(SourceKind::OpticalFlow, &example).is_err());

        let example = fragment("opticalflow_data", vec![0.3, -0.99]);
        assert!(validate_fragment(SourceKind::OpticalFlow, &example).is_ok());
    }
}
