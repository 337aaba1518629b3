use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::market::PricePoint;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

impl ChartSeries {
    /// Labels are the UTC day, e.g. "Nov 14". Values are rounded to cents. Points whose timestamp
    /// cannot be represented are dropped.
    pub fn from_points(points: &[PricePoint]) -> Self {
        let format = format_description!("[month repr:short] [day]");
        let mut series = Self::default();
        for point in points {
            let nanos = i128::from(point.timestamp_ms) * 1_000_000;
            let label = OffsetDateTime::from_unix_timestamp_nanos(nanos)
                .ok()
                .and_then(|date| date.format(format).ok());
            match label {
                Some(label) => {
                    series.labels.push(label);
                    series.values.push((point.price * 100.0).round() / 100.0);
                }
                None => log::warn!("Dropping chart point at {}", point.timestamp_ms),
            }
        }
        series
    }
}

#[cfg(test)]
mod tests {
    use super::ChartSeries;
    use crate::market::PricePoint;

    #[test]
    fn test_that_points_become_day_labels_and_rounded_values() {
        let points = vec![
            PricePoint {
                timestamp_ms: 1_700_000_000_000,
                price: 36512.3456,
            },
            PricePoint {
                timestamp_ms: 1_700_086_400_000,
                price: 36000.004,
            },
        ];
        let series = ChartSeries::from_points(&points);
        assert!(series.labels == vec!["Nov 14", "Nov 15"]);
        assert!(series.values == vec![36512.35, 36000.0]);
    }

    #[test]
    fn test_that_out_of_range_points_are_dropped() {
        let points = vec![PricePoint {
            timestamp_ms: i64::MAX,
            price: 1.0,
        }];
        assert!(ChartSeries::from_points(&points) == ChartSeries::default());
    }
}
