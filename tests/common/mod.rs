//! Shared request double for integration tests.

use rategate::RequestView;

/// A request built from plain parts.
pub struct TestRequest {
    method: String,
    path: String,
    uri: String,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
    claims: Vec<(String, String)>,
}

#[allow(dead_code)]
impl TestRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            uri: path.to_string(),
            headers: Vec::new(),
            params: Vec::new(),
            claims: Vec::new(),
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_query_param(mut self, name: &str, value: &str) -> Self {
        self.uri = if self.params.is_empty() {
            format!("{}?{}={}", self.path, name, value)
        } else {
            format!("{}&{}={}", self.uri, name, value)
        };
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_claim(mut self, name: &str, value: &str) -> Self {
        self.claims.push((name.to_string(), value.to_string()));
        self
    }
}

impl RequestView for TestRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn claim(&self, name: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}
