//! Position containment over a decoded document's ranges.

use bundle_types::{Id, RangeData};
use std::collections::HashMap;

/// Return every range containing the given position, ordered outside-in:
/// the first element is the largest enclosing range, the last the smallest.
///
/// Ranges are not required to be disjoint; nested scopes routinely produce
/// several hits for one position. Ties between ranges of equal extent are
/// broken by range identifier so the order is deterministic.
pub(crate) fn find_ranges(
    ranges: &HashMap<Id, RangeData>,
    line: u32,
    character: u32,
) -> Vec<RangeData> {
    let mut containing: Vec<(&Id, &RangeData)> = ranges
        .iter()
        .filter(|(_, r)| r.contains(line, character))
        .collect();

    containing.sort_by(|(id_a, a), (id_b, b)| {
        let start_a = (a.start_line, a.start_character);
        let start_b = (b.start_line, b.start_character);
        let end_a = (a.end_line, a.end_character);
        let end_b = (b.end_line, b.end_character);

        // an enclosing range starts no later and ends no earlier
        start_a
            .cmp(&start_b)
            .then(end_b.cmp(&end_a))
            .then(id_a.cmp(id_b))
    });

    containing.into_iter().map(|(_, r)| r.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(coords: (u32, u32, u32, u32)) -> RangeData {
        RangeData {
            start_line: coords.0,
            start_character: coords.1,
            end_line: coords.2,
            end_character: coords.3,
            definition_result_id: None,
            reference_result_id: None,
            hover_result_id: None,
            moniker_ids: vec![],
        }
    }

    fn ranges(entries: &[(&str, (u32, u32, u32, u32))]) -> HashMap<Id, RangeData> {
        entries
            .iter()
            .map(|(id, coords)| (Id::from(*id), range(*coords)))
            .collect()
    }

    #[test]
    fn test_nested_ranges_ordered_outside_in() {
        // a function body containing a statement containing an identifier
        let ranges = ranges(&[
            ("function", (10, 0, 40, 1)),
            ("statement", (20, 4, 20, 40)),
            ("identifier", (20, 10, 20, 16)),
            ("elsewhere", (30, 0, 30, 5)),
        ]);

        let found = find_ranges(&ranges, 20, 12);
        let extents: Vec<_> = found
            .iter()
            .map(|r| (r.start_line, r.start_character, r.end_line, r.end_character))
            .collect();

        assert_eq!(
            extents,
            vec![(10, 0, 40, 1), (20, 4, 20, 40), (20, 10, 20, 16)]
        );
    }

    #[test]
    fn test_no_containing_range() {
        let ranges = ranges(&[("only", (5, 0, 5, 10))]);
        assert!(find_ranges(&ranges, 6, 0).is_empty());
    }

    #[test]
    fn test_shared_start_orders_by_end() {
        let ranges = ranges(&[("inner", (7, 2, 7, 8)), ("outer", (7, 2, 9, 0))]);

        let found = find_ranges(&ranges, 7, 3);
        assert_eq!(
            found.iter().map(|r| r.end_line).collect::<Vec<_>>(),
            vec![9, 7]
        );
    }

    #[test]
    fn test_equal_extent_ties_are_deterministic() {
        let ranges = ranges(&[("b", (1, 0, 1, 5)), ("a", (1, 0, 1, 5))]);

        // identical extents fall back to identifier order
        let found = find_ranges(&ranges, 1, 2);
        assert_eq!(found.len(), 2);
        let again = find_ranges(&ranges, 1, 2);
        assert_eq!(found, again);
    }
}
