//! Request methods and path normalisation into rate-limit route keys.

use serde::{Deserialize, Serialize};

/// Resources whose id is a major parameter and gets its own limit.
const MAJOR_RESOURCES: &[&str] = &["channels", "guilds", "webhooks"];

const ID_PLACEHOLDER: &str = ":id";
const TOKEN_PLACEHOLDER: &str = ":token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl RequestMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
            RequestMethod::Patch => "PATCH",
            RequestMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_id(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Strip scheme, host, API version prefix and query from a URL.
fn path_of(url: &str) -> &str {
    let url = url.split(['?', '#']).next().unwrap_or_default();
    let path = match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            rest.find('/').map_or("", |slash| &rest[slash..])
        }
        None => url,
    };
    match path.find("/v") {
        Some(start) => {
            let after = &path[start + 2..];
            let digits = after.bytes().take_while(u8::is_ascii_digit).count();
            if digits > 0 && (after.len() == digits || after.as_bytes()[digits] == b'/') {
                &after[digits..]
            } else {
                path
            }
        }
        None => path,
    }
}

/// Normalise a request path into its rate-limit route.
///
/// Ids that follow a major resource are kept, other numeric ids collapse
/// onto `:id`, interaction tokens onto `:token`, and every reaction path
/// under a message shares the `/reactions` route.
pub fn simplify_url(url: &str) -> String {
    let mut route = String::new();
    let mut previous: Option<&str> = None;
    let mut previous_was_interaction_id = false;

    for segment in path_of(url).split('/').filter(|s| !s.is_empty()) {
        if previous == Some("reactions") {
            break;
        }
        let normalised = if is_id(segment) {
            match previous {
                Some(resource) if MAJOR_RESOURCES.contains(&resource) => segment,
                _ => ID_PLACEHOLDER,
            }
        } else if previous_was_interaction_id {
            TOKEN_PLACEHOLDER
        } else {
            segment
        };
        previous_was_interaction_id = previous == Some("interactions") && is_id(segment);
        route.push('/');
        route.push_str(normalised);
        previous = Some(segment);
    }

    if route.is_empty() {
        route.push('/');
    }
    route
}

/// The key a request queue is stored under: method plus normalised route.
pub fn route_key(method: RequestMethod, url: &str) -> String {
    format!("{} {}", method, simplify_url(url))
}
