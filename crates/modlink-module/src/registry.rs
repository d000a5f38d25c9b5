use std::collections::BTreeMap;

use modlink_peer::{Category, Methods, Value};

use crate::error::{RegistrationError, Result};
use crate::request::{
    DataLoaderRequest, DataParserRequest, DataPostProcessorRequest, IteratorRequest,
    SitePostProcessorRequest, TemplateFunctionRequest,
};
use crate::response::{RelayResponse, TemplateFunctionResponse};

pub type DataLoaderHandler = Box<dyn Fn(DataLoaderRequest, &mut RelayResponse) + Send>;
pub type DataParserHandler = Box<dyn Fn(DataParserRequest, &mut RelayResponse) + Send>;
pub type DataPostProcessorHandler = Box<dyn Fn(DataPostProcessorRequest, &mut RelayResponse) + Send>;
pub type SitePostProcessorHandler = Box<dyn Fn(SitePostProcessorRequest, &mut RelayResponse) + Send>;
pub type IteratorHandler = Box<dyn Fn(IteratorRequest, &mut RelayResponse) + Send>;
pub type TemplateFunctionHandler =
    Box<dyn Fn(TemplateFunctionRequest, &mut TemplateFunctionResponse) + Send>;

/// Receives the host's configuration map. An `Err` is reported to the host
/// as a fatal entry.
pub type ConfigFunctionHandler =
    Box<dyn FnMut(&BTreeMap<String, Value>) -> std::result::Result<(), String> + Send>;

/// Self-test for a template function: calling it with `request` must
/// produce exactly `response` and no fatal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub request: Vec<Value>,
    pub response: Value,
}

impl Fixture {
    pub fn new(request: Vec<Value>, response: impl Into<Value>) -> Self {
        Self {
            request,
            response: response.into(),
        }
    }

    fn validate(&self, identifier: &str) -> Result<()> {
        let reason = if self.request.is_empty() {
            "request data is empty"
        } else if self.response.is_null() {
            "response data is null"
        } else {
            return Ok(());
        };
        Err(RegistrationError::IncompleteFixture {
            identifier: identifier.to_string(),
            reason,
        })
    }
}

pub(crate) struct TemplateEntry {
    pub(crate) handler: TemplateFunctionHandler,
    pub(crate) fixture: Fixture,
}

/// All handlers a module exposes, keyed by identifier per category.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) data_loaders: BTreeMap<String, DataLoaderHandler>,
    pub(crate) data_parsers: BTreeMap<String, DataParserHandler>,
    pub(crate) data_post_processors: BTreeMap<String, DataPostProcessorHandler>,
    pub(crate) site_post_processors: BTreeMap<String, SitePostProcessorHandler>,
    pub(crate) iterators: BTreeMap<String, IteratorHandler>,
    pub(crate) template_functions: BTreeMap<String, TemplateEntry>,
}

/// Insert `value` under a fresh, non-empty identifier.
pub(crate) fn insert<T>(
    map: &mut BTreeMap<String, T>,
    category: Category,
    identifier: &str,
    value: T,
) -> Result<()> {
    if identifier.is_empty() {
        return Err(RegistrationError::EmptyIdentifier {
            category: category.key(),
        });
    }
    if map.contains_key(identifier) {
        return Err(RegistrationError::Duplicate {
            category: category.key(),
            identifier: identifier.to_string(),
        });
    }
    map.insert(identifier.to_string(), value);
    Ok(())
}

impl Registry {
    pub(crate) fn insert_template_function(
        &mut self,
        identifier: &str,
        handler: TemplateFunctionHandler,
        fixture: Fixture,
    ) -> Result<()> {
        if !identifier.is_empty() {
            fixture.validate(identifier)?;
        }
        insert(
            &mut self.template_functions,
            Category::TemplateFunctions,
            identifier,
            TemplateEntry { handler, fixture },
        )
    }

    /// Every category with its sorted identifiers, empty ones included.
    pub(crate) fn methods(&self) -> Methods {
        Category::ALL
            .into_iter()
            .map(|category| (category.key().to_string(), self.identifiers(category)))
            .collect()
    }

    fn identifiers(&self, category: Category) -> Vec<String> {
        match category {
            Category::TemplateFunctions => keys(&self.template_functions),
            Category::DataLoaders => keys(&self.data_loaders),
            Category::DataParsers => keys(&self.data_parsers),
            Category::DataPostProcessors => keys(&self.data_post_processors),
            Category::SitePostProcessors => keys(&self.site_post_processors),
            Category::Iterators => keys(&self.iterators),
        }
    }
}

fn keys<T>(map: &BTreeMap<String, T>) -> Vec<String> {
    map.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_loader() -> DataLoaderHandler {
        Box::new(|_, _| {})
    }

    #[test]
    fn methods_lists_every_category_sorted() {
        let mut registry = Registry::default();
        insert(&mut registry.data_loaders, Category::DataLoaders, "zeta", noop_loader()).unwrap();
        insert(&mut registry.data_loaders, Category::DataLoaders, "alpha", noop_loader()).unwrap();

        let methods = registry.methods();
        assert_eq!(methods.len(), 6);
        assert_eq!(methods["dataLoaders"], vec!["alpha", "zeta"]);
        assert!(methods["iterators"].is_empty());
    }

    #[test]
    fn duplicate_and_empty_identifiers_rejected() {
        let mut registry = Registry::default();
        insert(&mut registry.data_loaders, Category::DataLoaders, "file", noop_loader()).unwrap();

        assert_eq!(
            insert(&mut registry.data_loaders, Category::DataLoaders, "file", noop_loader()),
            Err(RegistrationError::Duplicate {
                category: "dataLoaders",
                identifier: "file".to_string()
            })
        );
        assert_eq!(
            insert(&mut registry.data_loaders, Category::DataLoaders, "", noop_loader()),
            Err(RegistrationError::EmptyIdentifier {
                category: "dataLoaders"
            })
        );
    }

    #[test]
    fn incomplete_fixtures_rejected() {
        let mut registry = Registry::default();
        let err = registry
            .insert_template_function(
                "noescape",
                Box::new(|_, _| {}),
                Fixture::new(Vec::new(), "x"),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::IncompleteFixture { .. }));

        let err = registry
            .insert_template_function(
                "noescape",
                Box::new(|_, _| {}),
                Fixture::new(vec![Value::from("x")], Value::Null),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::IncompleteFixture {
                reason: "response data is null",
                ..
            }
        ));
        assert!(registry.template_functions.is_empty());
    }
}
