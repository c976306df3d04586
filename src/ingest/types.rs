// src/ingest/types.rs
use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One page returned by the alerts endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertPage {
    pub alerts: Vec<RawAlert>,
    /// Empty when the API did not hand out a new cursor.
    pub cursor: String,
}

/// Alert as delivered by the remote API. Sub-objects are kept loose so one
/// odd field never fails the whole page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAlert {
    #[serde(default)]
    pub alert_id: String,
    #[serde(default)]
    pub headline: String,
    #[serde(default, deserialize_with = "lenient")]
    pub alert_type: Option<NamedRef>,
    /// Epoch milliseconds or an RFC 3339 string.
    #[serde(default)]
    pub event_time: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub estimated_event_location: Option<RawLocation>,
    #[serde(default, deserialize_with = "lenient")]
    pub sub_headline: Option<RawSubHeadline>,
    #[serde(default, deserialize_with = "lenient")]
    pub topics: Vec<NamedRef>,
    #[serde(default, deserialize_with = "lenient")]
    pub lists: Vec<NamedRef>,
    #[serde(default, deserialize_with = "lenient")]
    pub linked_alerts: Vec<LinkedAlert>,
    #[serde(default, deserialize_with = "lenient")]
    pub public_post: Option<RawPost>,
    #[serde(default, rename = "firstAlertURL")]
    pub first_alert_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedAlert {
    #[serde(default)]
    pub parent_alert_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLocation {
    #[serde(default)]
    pub name: String,
    /// `[lat, lng]`
    #[serde(default)]
    pub coordinates: Vec<f64>,
    /// Miles.
    #[serde(default)]
    pub probability_radius: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSubHeadline {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPost {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub translated_text: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub media: Vec<RawMedia>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMedia {
    #[serde(default)]
    pub url: String,
}

/// Malformed sub-objects degrade to their default instead of failing the alert.
fn lenient<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let v = Value::deserialize(d)?;
    Ok(serde_json::from_value(v).unwrap_or_default())
}

impl RawAlert {
    /// Parse `eventTime`; `None` when absent or unparseable.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        match self.event_time.as_ref()? {
            Value::Number(n) => {
                let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
                Utc.timestamp_millis_opt(ms).single()
            }
            Value::String(s) => {
                if let Ok(ms) = s.trim().parse::<i64>() {
                    return Utc.timestamp_millis_opt(ms).single();
                }
                DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }
            _ => None,
        }
    }
}

/// Geographic context attached to an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLocation {
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub confidence_radius_meters: Option<f64>,
}

/// Vendor-neutral alert handed to the output sink. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAlert {
    pub backend_name: String,
    pub alert_id: String,
    pub headline: String,
    pub alert_type: String,
    pub event_time: Option<DateTime<Utc>>,
    pub location: Option<AlertLocation>,
    pub sub_headline: Option<String>,
    pub topics: Vec<String>,
    pub alert_lists: Vec<String>,
    pub linked_alerts: Vec<String>,
    pub source_text: Option<String>,
    pub translated_text: Option<String>,
    pub public_source_url: Option<String>,
    /// First entry is the primary media item.
    pub media_urls: Vec<String>,
    pub alert_url: Option<String>,
}

impl NormalizedAlert {
    pub fn primary_media(&self) -> Option<&str> {
        self.media_urls.first().map(String::as_str)
    }
}
