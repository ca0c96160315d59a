//! Inbound and outbound permitted lists.

use regex::Regex;
use serde_json::{Map, Value};

use crate::config::PermittedConfig;

/// Outcome of checking an address against a permitted list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// No entry matched
    Denied,
    /// Matched an entry that needs no authorisation
    Allowed,
    /// Matched an entry that needs an `authorise` handler to allow
    RequiresAuth,
}

#[derive(Debug, Clone)]
struct Rule {
    address: Option<String>,
    address_re: Option<Regex>,
    body: Option<Map<String, Value>>,
    requires_auth: bool,
}

impl Rule {
    fn matches_address(&self, address: &str) -> bool {
        if let Some(exact) = &self.address {
            if exact != address {
                return false;
            }
        }
        if let Some(re) = &self.address_re {
            if !re.is_match(address) {
                return false;
            }
        }
        true
    }

    fn matches_body(&self, body: Option<&Value>) -> bool {
        let Some(required) = &self.body else {
            return true;
        };
        let Some(Value::Object(fields)) = body else {
            return false;
        };
        required.iter().all(|(k, v)| fields.get(k) == Some(v))
    }
}

/// An ordered permitted list. The first matching entry decides.
#[derive(Debug, Clone, Default)]
pub struct PermittedList {
    rules: Vec<Rule>,
}

impl PermittedList {
    /// Compile a list from configuration. Regexes are anchored to match the
    /// whole address.
    pub fn compile(entries: &[PermittedConfig]) -> Result<Self, regex::Error> {
        let rules = entries
            .iter()
            .map(|entry| {
                Ok(Rule {
                    address: entry.address.clone(),
                    address_re: entry
                        .address_re
                        .as_deref()
                        .map(|re| Regex::new(&format!("^(?:{re})$")))
                        .transpose()?,
                    body: entry.match_.clone(),
                    requires_auth: entry.requires_auth,
                })
            })
            .collect::<Result<_, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// A list that permits every address.
    pub fn allow_all() -> Self {
        Self {
            rules: vec![Rule {
                address: None,
                address_re: None,
                body: None,
                requires_auth: false,
            }],
        }
    }

    /// Check an address, ignoring body matches.
    pub fn check_address(&self, address: &str) -> Permit {
        self.rules
            .iter()
            .find(|rule| rule.matches_address(address))
            .map_or(Permit::Denied, permit)
    }

    /// Check an address and the JSON body sent to it.
    pub fn check(&self, address: &str, body: Option<&Value>) -> Permit {
        self.rules
            .iter()
            .find(|rule| rule.matches_address(address) && rule.matches_body(body))
            .map_or(Permit::Denied, permit)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn permit(rule: &Rule) -> Permit {
    if rule.requires_auth {
        Permit::RequiresAuth
    } else {
        Permit::Allowed
    }
}
