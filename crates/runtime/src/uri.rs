use percent_encoding::percent_decode_str;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::Error;

/// Endpoint is a resolved endpoint URI: variables expanded against the
/// engine's environment snapshot, then parsed into its parts. Whether the
/// endpoint acts as a source or a sink is decided by its position in the
/// route, not here, and unknown schemes only error at registry lookup.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// The expanded URI as written, for logs and error reports.
    pub uri: String,
    pub url: url::Url,
    pub scheme: String,
    /// The authority host verbatim. Schemes like `timer://250ms` smuggle
    /// non-host tokens here; their drivers parse it further.
    pub host: String,
    pub port: Option<u16>,
    /// Percent-decoded path.
    pub path: String,
    pub query: BTreeMap<String, String>,
}

impl Endpoint {
    /// Expand `{{NAME}}` / `{{NAME|default('x')}}` placeholders against
    /// the environment snapshot and parse the result. A placeholder with
    /// neither a value nor a default is a configuration error.
    pub fn resolve(raw: &str, env: &BTreeMap<String, String>) -> Result<Self, Error> {
        let expanded = expr::expand(raw, |name| {
            env.get(name).map(|v| Value::String(v.clone()))
        })
        .map_err(|err| Error::config(format!("expanding '{raw}': {err}")))?;

        let url = url::Url::parse(&expanded)
            .map_err(|err| Error::config(format!("invalid URI '{expanded}': {err}")))?;

        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            uri: expanded.clone(),
            scheme: url.scheme().to_string(),
            host: url.host_str().unwrap_or_default().to_string(),
            port: url.port(),
            path: percent_decode_str(url.path()).decode_utf8_lossy().into_owned(),
            query,
            url,
        })
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// The authority as `host:port`, or just the host when no port is set.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}
