use tracing::{debug, warn};

use crate::registry::Registry;
use crate::request::template_function;
use crate::response::TemplateFunctionResponse;

/// Run every template function against its fixture.
///
/// A run fails on a fatal entry or on data that differs from the fixture.
pub(crate) fn run_fixtures(registry: &Registry) -> bool {
    let mut passed = true;
    for (identifier, entry) in &registry.template_functions {
        let mut response = TemplateFunctionResponse::new();
        (entry.handler)(template_function(entry.fixture.request.clone()), &mut response);

        if response.has_fatal() {
            warn!(identifier, "self-test reported a fatal entry");
            passed = false;
        } else if response.data != entry.fixture.response {
            warn!(
                identifier,
                expected = %entry.fixture.response,
                got = %response.data,
                "self-test returned unexpected data"
            );
            passed = false;
        } else {
            debug!(identifier, "self-test passed");
        }
    }
    passed
}
