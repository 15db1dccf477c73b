//! Prediction and input id derivation.
//!
//! An input id is `{prediction_id}-{zero-padded index}`, so the owning
//! prediction is always recoverable from the id's string prefix.

/// Derive the input ids for a prediction with `num_inputs` units.
///
/// Indexes are zero-padded to the width of `num_inputs` so ids sort
/// lexicographically in unit order.
pub fn input_ids_for_prediction(prediction_id: &str, num_inputs: usize) -> Vec<String> {
    let width = num_inputs.to_string().len();
    (0..num_inputs)
        .map(|idx| format!("{prediction_id}-{idx:0width$}"))
        .collect()
}

/// Recover the prediction id from an input id.
pub fn prediction_id_of_input(input_id: &str) -> &str {
    input_id.split('-').next().unwrap_or(input_id)
}

/// Whether an input id belongs to a prediction.
pub fn input_in_prediction(input_id: &str, prediction_id: &str) -> bool {
    input_id.starts_with(prediction_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_ids_are_zero_padded() {
        let ids = input_ids_for_prediction("abc123", 10);
        assert_eq!(ids.len(), 10);
        assert_eq!(ids[0], "abc123-00");
        assert_eq!(ids[9], "abc123-09");
    }

    #[test]
    fn single_input_uses_one_digit() {
        let ids = input_ids_for_prediction("abc123", 1);
        assert_eq!(ids, vec!["abc123-0"]);
    }

    #[test]
    fn prediction_id_roundtrip() {
        for id in input_ids_for_prediction("deadbeef", 3) {
            assert_eq!(prediction_id_of_input(&id), "deadbeef");
            assert!(input_in_prediction(&id, "deadbeef"));
            assert!(!input_in_prediction(&id, "cafebabe"));
        }
    }
}
