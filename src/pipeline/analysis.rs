//! Maps the structured-extraction service's taxonomy onto normalized draft
//! fields.
//!
//! The taxonomy is category specific (bike / part / apparel). Only the
//! details block of the resolved category is populated from a report; the
//! other blocks are left untouched so that switching category during review
//! keeps previously filled values around without showing them.

use crate::services::{AnalysisReport, PriceEstimate};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Bike,
    Part,
    Apparel,
}

const PART_KEYWORDS: &[&str] = &[
    "wheel", "wheelset", "groupset", "derailleur", "crank", "cassette", "chain", "saddle",
    "seatpost", "handlebar", "stem", "fork", "shock", "brake", "pedal", "tyre", "tire", "frameset",
    "component", "part",
];

const APPAREL_KEYWORDS: &[&str] = &[
    "jersey", "bib", "short", "jacket", "glove", "shoe", "helmet", "sock", "vest", "apparel",
    "kit", "gilet",
];

impl Category {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "bike" | "bikes" | "bicycle" | "frame" => Some(Self::Bike),
            "part" | "parts" | "component" | "components" => Some(Self::Part),
            "apparel" | "clothing" | "gear" => Some(Self::Apparel),
            _ => None,
        }
    }

    /// Keyword guess from a free-text item type, e.g. "carbon wheelset".
    /// The head noun decides, so words are scanned from the end: "disc brake
    /// road bike" is a bike, "bike helmet" is apparel.
    pub fn infer_from_item_type(item_type: &str) -> Option<Self> {
        let lowered = item_type.to_lowercase();
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .rev()
            .find_map(Self::from_keyword)
    }

    fn from_keyword(word: &str) -> Option<Self> {
        if word.contains("bike") || word.contains("bicycle") {
            Some(Self::Bike)
        } else if APPAREL_KEYWORDS.iter().any(|kw| word.contains(kw)) {
            Some(Self::Apparel)
        } else if PART_KEYWORDS.iter().any(|kw| word.contains(kw)) {
            Some(Self::Part)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bike => "bike",
            Self::Part => "part",
            Self::Apparel => "apparel",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BikeDetails {
    pub bike_type: Option<String>,
    pub frame_size: Option<String>,
    pub frame_material: Option<String>,
    pub wheel_size: Option<String>,
    pub groupset: Option<String>,
    pub brake_type: Option<String>,
    pub suspension: Option<String>,
    pub year: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartDetails {
    pub part_type: Option<String>,
    pub compatibility: Option<String>,
    pub material: Option<String>,
    pub weight_grams: Option<f64>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApparelDetails {
    pub apparel_type: Option<String>,
    pub size: Option<String>,
    pub gender: Option<String>,
    pub material: Option<String>,
}

macro_rules! merge_fields {
    ($target:expr, $patch:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if $patch.$field.is_some() {
                $target.$field = $patch.$field.clone();
            }
        )+
    };
}

impl BikeDetails {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge(&mut self, patch: &Self) {
        merge_fields!(
            self,
            patch,
            [bike_type, frame_size, frame_material, wheel_size, groupset, brake_type, suspension, year]
        );
    }
}

impl PartDetails {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge(&mut self, patch: &Self) {
        merge_fields!(self, patch, [part_type, compatibility, material, weight_grams]);
    }
}

impl ApparelDetails {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge(&mut self, patch: &Self) {
        merge_fields!(self, patch, [apparel_type, size, gender, material]);
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFields {
    pub title: String,
    pub description: Option<String>,
    pub category: Category,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub item_type: Option<String>,
    /// 1 (poor) to 10 (as new).
    pub condition_rating: Option<u8>,
    pub wear_notes: Option<String>,
    pub price_aud: Option<u32>,
    pub original_retail_price_aud: Option<u32>,
    #[serde(default)]
    pub bike: BikeDetails,
    #[serde(default)]
    pub part: PartDetails,
    #[serde(default)]
    pub apparel: ApparelDetails,
}

impl NormalizedFields {
    /// Details block for the active category only; latent blocks stay hidden.
    pub fn visible_details(&self) -> Value {
        match self.category {
            Category::Bike => json!(self.bike),
            Category::Part => json!(self.part),
            Category::Apparel => json!(self.apparel),
        }
    }

    pub fn category_details_empty(&self) -> bool {
        self.bike.is_empty() && self.part.is_empty() && self.apparel.is_empty()
    }
}

/// Hints forwarded to the analysis service alongside the image URLs.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisHints {
    pub category: Option<Category>,
    pub suggested_name: Option<String>,
}

/// Near-empty draft used when analysis of a group fails.
pub fn default_fields(suggested_name: &str, hint: Option<Category>) -> NormalizedFields {
    NormalizedFields {
        title: suggested_name.to_string(),
        category: hint.unwrap_or_default(),
        ..NormalizedFields::default()
    }
}

pub fn resolve_category(report: &AnalysisReport, hint: Option<Category>) -> Category {
    hint.or_else(|| report.category.as_deref().and_then(Category::from_label))
        .or_else(|| {
            report
                .item_type
                .as_deref()
                .and_then(Category::infer_from_item_type)
        })
        .or_else(|| filled_details_category(report))
        .unwrap_or_default()
}

/// The category whose details block is the only one the service filled.
fn filled_details_category(report: &AnalysisReport) -> Option<Category> {
    let filled = [
        (Category::Bike, report.bike_details.as_ref().is_some_and(|d| !d.is_empty())),
        (Category::Part, report.part_details.as_ref().is_some_and(|d| !d.is_empty())),
        (
            Category::Apparel,
            report.apparel_details.as_ref().is_some_and(|d| !d.is_empty()),
        ),
    ];
    let mut found = filled.iter().filter(|(_, filled)| *filled);
    match (found.next(), found.next()) {
        (Some((category, _)), None) => Some(*category),
        _ => None,
    }
}

/// `(price, original_retail_price)` from the service's min/max band. The
/// price is the rounded midpoint; the max is kept as the retail reference.
pub fn price_from_band(estimate: &PriceEstimate) -> (Option<u32>, Option<u32>) {
    let min = estimate.min_aud.filter(|v| v.is_finite() && *v >= 0.0);
    let max = estimate.max_aud.filter(|v| v.is_finite() && *v >= 0.0);
    let price = match (min, max) {
        (Some(min), Some(max)) => Some(((min + max) / 2.0).round()),
        (Some(only), None) | (None, Some(only)) => Some(only.round()),
        (None, None) => None,
    };
    (price.map(to_whole_dollars), max.map(|v| to_whole_dollars(v.round())))
}

fn to_whole_dollars(value: f64) -> u32 {
    value.clamp(0.0, u32::MAX as f64) as u32
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn build_title(report: &AnalysisReport, suggested_name: &str) -> String {
    if let Some(title) = clean(&report.title) {
        return title;
    }
    let parts: Vec<String> = [&report.brand, &report.model]
        .into_iter()
        .filter_map(clean)
        .collect();
    if !parts.is_empty() {
        let mut title = parts.join(" ");
        if let Some(item_type) = clean(&report.item_type) {
            title.push(' ');
            title.push_str(&item_type);
        }
        return title;
    }
    clean(&report.item_type).unwrap_or_else(|| suggested_name.to_string())
}

pub fn map_report(
    report: &AnalysisReport,
    hint: Option<Category>,
    suggested_name: &str,
) -> NormalizedFields {
    let category = resolve_category(report, hint);
    let (price_aud, original_retail_price_aud) = report
        .price_estimate
        .as_ref()
        .map(price_from_band)
        .unwrap_or((None, None));
    let condition_rating = report
        .condition_rating
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(1.0, 10.0) as u8);

    let mut fields = NormalizedFields {
        title: build_title(report, suggested_name),
        description: clean(&report.description),
        category,
        brand: clean(&report.brand),
        model: clean(&report.model),
        item_type: clean(&report.item_type),
        condition_rating,
        wear_notes: clean(&report.wear_notes),
        price_aud,
        original_retail_price_aud,
        ..NormalizedFields::default()
    };

    match category {
        Category::Bike => {
            if let Some(details) = &report.bike_details {
                fields.bike = details.clone();
            }
        }
        Category::Part => {
            if let Some(details) = &report.part_details {
                fields.part = details.clone();
            }
        }
        Category::Apparel => {
            if let Some(details) = &report.apparel_details {
                fields.apparel = details.clone();
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bike_report() -> AnalysisReport {
        AnalysisReport {
            brand: Some("Trek".into()),
            model: Some("Domane SL5".into()),
            item_type: Some("road bike".into()),
            bike_details: Some(BikeDetails {
                frame_size: Some("56cm".into()),
                frame_material: Some("carbon".into()),
                groupset: Some("Shimano 105".into()),
                ..BikeDetails::default()
            }),
            part_details: Some(PartDetails {
                part_type: Some("wheelset".into()),
                ..PartDetails::default()
            }),
            condition_rating: Some(7.6),
            wear_notes: Some("  light scuffs on top tube ".into()),
            price_estimate: Some(PriceEstimate {
                min_aud: Some(1800.0),
                max_aud: Some(2401.0),
            }),
            ..AnalysisReport::default()
        }
    }

    #[test]
    fn midpoint_price_and_retail_reference() {
        let (price, retail) = price_from_band(&PriceEstimate {
            min_aud: Some(100.0),
            max_aud: Some(251.0),
        });
        assert_eq!(price, Some(176));
        assert_eq!(retail, Some(251));
    }

    #[test]
    fn one_sided_band_uses_available_bound() {
        let (price, retail) = price_from_band(&PriceEstimate {
            min_aud: Some(80.4),
            max_aud: None,
        });
        assert_eq!(price, Some(80));
        assert_eq!(retail, None);
    }

    #[test]
    fn bike_report_populates_bike_taxonomy_only() {
        let fields = map_report(&bike_report(), None, "Product 1");
        assert_eq!(fields.category, Category::Bike);
        assert_eq!(fields.title, "Trek Domane SL5 road bike");
        assert_eq!(fields.bike.frame_size.as_deref(), Some("56cm"));
        assert!(fields.part.is_empty());
        assert_eq!(fields.condition_rating, Some(8));
        assert_eq!(fields.wear_notes.as_deref(), Some("light scuffs on top tube"));
        assert_eq!(fields.price_aud, Some(2101));
        assert_eq!(fields.original_retail_price_aud, Some(2401));
    }

    #[test]
    fn operator_hint_overrides_detected_category() {
        let fields = map_report(&bike_report(), Some(Category::Part), "Product 1");
        assert_eq!(fields.category, Category::Part);
        assert_eq!(fields.part.part_type.as_deref(), Some("wheelset"));
        assert!(fields.bike.is_empty());
    }

    #[test]
    fn category_falls_back_to_item_type_keywords() {
        let report = AnalysisReport {
            item_type: Some("Bib shorts".into()),
            ..AnalysisReport::default()
        };
        assert_eq!(resolve_category(&report, None), Category::Apparel);
        let report = AnalysisReport {
            category: Some("parts".into()),
            item_type: Some("jersey".into()),
            ..AnalysisReport::default()
        };
        assert_eq!(resolve_category(&report, None), Category::Part);
    }

    #[test]
    fn item_type_head_noun_decides_category() {
        for (item_type, expected) in [
            ("disc brake road bike", Category::Bike),
            ("fat tire bike", Category::Bike),
            ("Carbon wheelset", Category::Part),
            ("bike helmet", Category::Apparel),
            ("road bike brake calipers", Category::Part),
        ] {
            assert_eq!(
                Category::infer_from_item_type(item_type),
                Some(expected),
                "{item_type}"
            );
        }
        assert_eq!(Category::infer_from_item_type("mystery box"), None);
    }

    #[test]
    fn disc_brake_bike_keeps_bike_details() {
        let report = AnalysisReport {
            item_type: Some("disc brake road bike".into()),
            bike_details: Some(BikeDetails {
                frame_size: Some("56cm".into()),
                ..BikeDetails::default()
            }),
            ..AnalysisReport::default()
        };
        let fields = map_report(&report, None, "Product 1");
        assert_eq!(fields.category, Category::Bike);
        assert_eq!(fields.bike.frame_size.as_deref(), Some("56cm"));
    }

    #[test]
    fn lone_details_block_decides_when_nothing_else_does() {
        let report = AnalysisReport {
            item_type: Some("mystery box".into()),
            apparel_details: Some(ApparelDetails {
                size: Some("M".into()),
                ..ApparelDetails::default()
            }),
            ..AnalysisReport::default()
        };
        assert_eq!(resolve_category(&report, None), Category::Apparel);
    }

    #[test]
    fn switching_category_keeps_latent_fields() {
        let mut fields = map_report(&bike_report(), None, "Product 1");
        fields.category = Category::Apparel;
        assert_eq!(fields.visible_details(), json!({}));
        assert_eq!(fields.bike.groupset.as_deref(), Some("Shimano 105"));
        fields.category = Category::Bike;
        assert_eq!(fields.visible_details()["groupset"], json!("Shimano 105"));
    }

    #[test]
    fn defaults_carry_suggested_name() {
        let fields = default_fields("Product 2", None);
        assert_eq!(fields.title, "Product 2");
        assert!(fields.category_details_empty());
        assert_eq!(fields.price_aud, None);
    }
}
