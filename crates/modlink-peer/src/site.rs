use std::collections::BTreeMap;

use crate::value::Value;

/// Registered type name sites travel under.
pub const SITE_TYPE: &str = "site";

/// One page of the site tree as seen by site post-processors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Site {
    pub slug: String,
    pub template: String,
    pub data: BTreeMap<String, Value>,
}

impl Site {
    pub fn new(slug: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            template: template.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("slug".to_string(), Value::from(self.slug.as_str()));
        fields.insert("template".to_string(), Value::from(self.template.as_str()));
        fields.insert("data".to_string(), Value::Map(self.data.clone()));
        Value::typed(SITE_TYPE, Value::Map(fields))
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_typed(SITE_TYPE)?.as_map()?;
        Some(Self {
            slug: fields.get("slug")?.as_str()?.to_string(),
            template: fields.get("template")?.as_str()?.to_string(),
            data: fields.get("data")?.as_map()?.clone(),
        })
    }
}

pub fn sites_to_value(sites: &[Site]) -> Value {
    Value::List(sites.iter().map(Site::to_value).collect())
}

/// Parse a list of sites; `None` if any element is not a site.
pub fn sites_from_value(value: &Value) -> Option<Vec<Site>> {
    value.as_list()?.iter().map(Site::from_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_value_roundtrip() {
        let mut site = Site::new("/blog/", "blog.html");
        site.data.insert("title".into(), Value::from("Blog"));

        let value = site.to_value();
        assert!(value.as_typed(SITE_TYPE).is_some());
        assert_eq!(Site::from_value(&value), Some(site));
    }

    #[test]
    fn untyped_map_is_not_a_site() {
        let Value::Typed { value, .. } = Site::new("/", "index.html").to_value() else {
            panic!("site must be typed");
        };
        assert_eq!(Site::from_value(&value), None);
    }

    #[test]
    fn site_lists() {
        let sites = vec![Site::new("/", "a.html"), Site::new("/b/", "b.html")];
        assert_eq!(sites_from_value(&sites_to_value(&sites)), Some(sites));

        let mixed = Value::List(vec![Site::new("/", "a.html").to_value(), Value::Null]);
        assert_eq!(sites_from_value(&mixed), None);
    }
}
