use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Value of a single filter field. A field's variant is fixed by its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(i64),
    Date(Option<NaiveDate>),
    Flag(bool),
    List(Vec<String>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn date(year: i32, month: u32, day: u32) -> Self {
        Self::Date(NaiveDate::from_ymd_opt(year, month, day))
    }

    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn same_kind(&self, other: &FieldValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// URL/query representation. An empty vector means "omit the param".
    pub fn to_params(&self) -> Vec<String> {
        match self {
            Self::Text(value) if value.is_empty() => Vec::new(),
            Self::Text(value) => vec![value.clone()],
            Self::Number(value) => vec![value.to_string()],
            Self::Date(Some(date)) => vec![date.format("%Y-%m-%d").to_string()],
            Self::Date(None) => Vec::new(),
            Self::Flag(value) => vec![value.to_string()],
            Self::List(values) => values.iter().filter(|v| !v.is_empty()).cloned().collect(),
        }
    }

    /// Parses raw param values into the same variant as `self`.
    pub fn parse_like(&self, raw: &[String]) -> Option<FieldValue> {
        let first = raw.first().map(String::as_str);
        match self {
            Self::Text(_) => first.map(|v| Self::Text(v.to_owned())),
            Self::Number(_) => first.and_then(|v| v.trim().parse().ok()).map(Self::Number),
            Self::Date(_) => match first {
                Some("") => Some(Self::Date(None)),
                Some(v) => NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                    .ok()
                    .map(|date| Self::Date(Some(date))),
                None => None,
            },
            Self::Flag(_) => match first {
                Some("true" | "1") => Some(Self::Flag(true)),
                Some("false" | "0") => Some(Self::Flag(false)),
                _ => None,
            },
            Self::List(_) => Some(Self::List(
                raw.iter().filter(|v| !v.is_empty()).cloned().collect(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Cheap, low-cardinality fields: every change refetches.
    Auto,
    /// Expensive scanning filters: changes wait for an explicit apply.
    ManualApply,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub param: String,
    pub default: FieldValue,
    pub fetch: FetchMode,
    pub shareable: bool,
}

impl FieldSpec {
    pub fn auto(name: impl Into<String>, default: FieldValue) -> Self {
        let name = name.into();
        Self {
            param: name.clone(),
            name,
            default,
            fetch: FetchMode::Auto,
            shareable: true,
        }
    }

    pub fn manual(name: impl Into<String>, default: FieldValue) -> Self {
        Self {
            fetch: FetchMode::ManualApply,
            ..Self::auto(name, default)
        }
    }

    pub fn param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }

    /// Keeps the field out of the URL.
    pub fn local_only(mut self) -> Self {
        self.shareable = false;
        self
    }

    /// Value carried by the URL for this field, falling back to the default
    /// when the param is absent or unparsable.
    pub fn value_from_params(&self, raw: Option<&Vec<String>>) -> FieldValue {
        match raw {
            None => self.default.clone(),
            Some(raw) => self.default.parse_like(raw).unwrap_or_else(|| {
                debug!(field = %self.name, ?raw, "ignoring unparsable url value");
                self.default.clone()
            }),
        }
    }

    pub fn params_for(&self, value: &FieldValue) -> Vec<String> {
        if *value == self.default {
            Vec::new()
        } else {
            value.to_params()
        }
    }
}

/// One selectable entry of the reference list (a website).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

pub const WEBSITE_FIELD: &str = "website";

/// Field set shared by the analysis pages: website picker, period, custom
/// range, path filters, metric type and pagination.
pub fn analysis_page_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::auto(WEBSITE_FIELD, FieldValue::text("")),
        FieldSpec::auto("period", FieldValue::text("last_7_days")),
        FieldSpec::manual("from", FieldValue::Date(None)),
        FieldSpec::manual("to", FieldValue::Date(None)),
        FieldSpec::manual("path", FieldValue::List(Vec::new())),
        FieldSpec::manual("operator", FieldValue::text("contains")),
        FieldSpec::auto("metric", FieldValue::text("pageviews")),
        FieldSpec::auto("compare", FieldValue::Flag(false)),
        FieldSpec::auto("page", FieldValue::Number(1)),
        FieldSpec::auto("extra", FieldValue::Flag(false)).param("include_extra"),
    ]
}
