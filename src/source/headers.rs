use std::collections::HashMap;

/// Supplies extra request headers for a resource.
///
/// Returning `None` breaks the contract and makes the source open fail;
/// return an empty map to add nothing.
pub trait HeaderInjector: Send + Sync {
    fn add_headers(&self, url: &str) -> Option<HashMap<String, String>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyHeaderInjector;

impl HeaderInjector for EmptyHeaderInjector {
    fn add_headers(&self, _url: &str) -> Option<HashMap<String, String>> {
        Some(HashMap::new())
    }
}

/// Same headers for every resource.
#[derive(Debug, Default, Clone)]
pub struct StaticHeaderInjector {
    headers: HashMap<String, String>,
}

impl StaticHeaderInjector {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self { headers }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl HeaderInjector for StaticHeaderInjector {
    fn add_headers(&self, _url: &str) -> Option<HashMap<String, String>> {
        Some(self.headers.clone())
    }
}
