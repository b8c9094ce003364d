//! Ready-made comparison configurations
//!
//! Each template produces a null level, its specific levels ordered from most
//! to least strict, and the terminal else level.

use crate::comparison::ComparisonConfig;
use crate::dialect::DateUnit;
use crate::level::LevelConfig;

fn sorted(values: &[f64], descending: bool) -> Vec<f64> {
    let mut values = values.to_vec();
    values.sort_by(|a, b| a.total_cmp(b));
    if descending {
        values.reverse();
    }
    values.dedup();
    values
}

/// Null, exact match, else
pub fn exact_match(column: &str, term_frequency_adjustments: bool) -> ComparisonConfig {
    let mut exact = LevelConfig::exact_match(column);
    if term_frequency_adjustments {
        exact = exact.with_tf_adjustment(column);
    }
    ComparisonConfig::new(
        column,
        vec![
            LevelConfig::null_level(column),
            exact,
            LevelConfig::else_level(),
        ],
    )
    .with_description(format!("Exact match on {}", column))
}

/// Null, exact match, one level per Levenshtein distance threshold, else
pub fn levenshtein_at_thresholds(column: &str, thresholds: &[f64]) -> ComparisonConfig {
    let mut levels = vec![LevelConfig::null_level(column), LevelConfig::exact_match(column)];
    levels.extend(
        sorted(thresholds, false)
            .into_iter()
            .map(|t| LevelConfig::levenshtein(column, t)),
    );
    levels.push(LevelConfig::else_level());
    ComparisonConfig::new(column, levels)
        .with_description(format!("Levenshtein thresholds on {}", column))
}

/// Null, exact match, one level per Jaro-Winkler similarity threshold, else
pub fn jaro_winkler_at_thresholds(column: &str, thresholds: &[f64]) -> ComparisonConfig {
    let mut levels = vec![LevelConfig::null_level(column), LevelConfig::exact_match(column)];
    levels.extend(
        sorted(thresholds, true)
            .into_iter()
            .map(|t| LevelConfig::jaro_winkler(column, t)),
    );
    levels.push(LevelConfig::else_level());
    ComparisonConfig::new(column, levels)
        .with_description(format!("Jaro-Winkler thresholds on {}", column))
}

/// Null, exact match, one level per date window, else.
/// Windows are ordered from narrowest to widest.
pub fn datediff_at_thresholds(column: &str, windows: &[(f64, DateUnit)]) -> ComparisonConfig {
    let mut windows = windows.to_vec();
    windows.sort_by(|(a, ua), (b, ub)| days(*a, *ua).total_cmp(&days(*b, *ub)));

    let mut levels = vec![LevelConfig::null_level(column), LevelConfig::exact_match(column)];
    levels.extend(
        windows
            .into_iter()
            .map(|(t, unit)| LevelConfig::datediff(column, t, unit)),
    );
    levels.push(LevelConfig::else_level());
    ComparisonConfig::new(column, levels)
        .with_description(format!("Date difference thresholds on {}", column))
}

fn days(threshold: f64, unit: DateUnit) -> f64 {
    match unit {
        DateUnit::Day => threshold,
        DateUnit::Month => threshold * 30.4375,
        DateUnit::Year => threshold * 365.25,
    }
}

/// Null (either coordinate), one level per distance threshold, else
pub fn distance_in_km_at_thresholds(
    output_column_name: &str,
    lat_column: &str,
    lon_column: &str,
    km_thresholds: &[f64],
) -> ComparisonConfig {
    let mut levels = vec![
        LevelConfig::sql(
            format!(
                "{lat}_l IS NULL OR {lat}_r IS NULL OR {lon}_l IS NULL OR {lon}_r IS NULL",
                lat = lat_column,
                lon = lon_column
            ),
            "Null",
        ),
    ];
    levels[0].is_null_level = Some(true);
    levels.extend(
        sorted(km_thresholds, false)
            .into_iter()
            .map(|km| LevelConfig::distance_in_km(lat_column, lon_column, km)),
    );
    levels.push(LevelConfig::else_level());
    ComparisonConfig::new(output_column_name, levels)
}

/// Null, one level per minimum intersection size (largest first), else
pub fn array_intersect_at_sizes(column: &str, sizes: &[u32]) -> ComparisonConfig {
    let mut sizes = sizes.to_vec();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    sizes.dedup();

    let mut levels = vec![LevelConfig::null_level(column)];
    levels.extend(
        sizes
            .into_iter()
            .map(|n| LevelConfig::array_intersect(column, n)),
    );
    levels.push(LevelConfig::else_level());
    ComparisonConfig::new(column, levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparison::Comparison;
    use crate::dialect::SqliteDialect;

    #[test]
    fn test_levenshtein_thresholds_sorted_strict_first() {
        let config = levenshtein_at_thresholds("surname", &[3.0, 1.0]);
        let c = Comparison::from_config(&config, &SqliteDialect).unwrap();
        let labels: Vec<&str> = c.levels().iter().map(|l| l.label_for_charts()).collect();
        assert_eq!(
            labels,
            vec![
                "Null",
                "Exact match",
                "Levenshtein <= 1",
                "Levenshtein <= 3",
                "All other comparisons"
            ]
        );
        assert_eq!(c.num_non_null_levels(), 4);
    }

    #[test]
    fn test_jaro_winkler_thresholds_descending() {
        let config = jaro_winkler_at_thresholds("name", &[0.7, 0.9]);
        let c = Comparison::from_config(&config, &SqliteDialect).unwrap();
        assert_eq!(c.level_by_gamma(2).unwrap().label_for_charts(), "Jaro_winkler >= 0.9");
        assert_eq!(c.level_by_gamma(1).unwrap().label_for_charts(), "Jaro_winkler >= 0.7");
    }

    #[test]
    fn test_datediff_windows_narrowest_first() {
        let config = datediff_at_thresholds("dob", &[(1.0, DateUnit::Year), (3.0, DateUnit::Month)]);
        let labels: Vec<String> = config
            .comparison_levels
            .iter()
            .filter_map(|l| l.predicate.as_ref().map(|p| p.default_label()))
            .collect();
        assert_eq!(labels[2], "Within 3 months");
        assert_eq!(labels[3], "Within 1 year");
    }

    #[test]
    fn test_distance_template_has_null_level() {
        let config = distance_in_km_at_thresholds("location", "lat", "lon", &[10.0, 1.0]);
        let c = Comparison::from_config(&config, &SqliteDialect).unwrap();
        assert!(c.levels()[0].is_null_level());
        assert_eq!(c.gamma_column_name(), "gamma_location");
        assert_eq!(c.input_columns(), vec!["lat", "lon"]);
    }

    #[test]
    fn test_exact_match_tf_column() {
        let config = exact_match("city", true);
        let c = Comparison::from_config(&config, &SqliteDialect).unwrap();
        assert_eq!(c.level_by_gamma(1).unwrap().tf_adjustment_column(), Some("city"));
    }

    #[test]
    fn test_array_sizes_largest_first() {
        let c = Comparison::from_config(&array_intersect_at_sizes("tags", &[1, 3]), &SqliteDialect)
            .unwrap();
        assert_eq!(
            c.level_by_gamma(2).unwrap().label_for_charts(),
            "Arrays intersect size >= 3"
        );
    }
}
