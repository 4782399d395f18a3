use serde_json::json;

use crate::compare::canonical_json;

use super::RouteSpec;

/// Length of the id prefix shown to users.
pub const SHORT_ID_LEN: usize = 8;

/// MD5 over the canonical serialization of both resolved sides, as
/// lower-case hex. Stable across runs and independent of key order.
pub fn route_id(left: &RouteSpec, right: &RouteSpec) -> String {
    labelled_route_id(left, right, None, None)
}

/// Like [`route_id`], with the route's explicit name and tag hashed in when
/// present. Unlabelled routes keep their side-only id.
pub fn labelled_route_id(
    left: &RouteSpec,
    right: &RouteSpec,
    name: Option<&str>,
    tag: Option<&str>,
) -> String {
    let mut identity = json!({
        "left": left.identity(),
        "right": right.identity(),
    });
    if let Some(fields) = identity.as_object_mut() {
        if let Some(name) = name {
            fields.insert("name".to_string(), json!(name));
        }
        if let Some(tag) = tag {
            fields.insert("tag".to_string(), json!(tag));
        }
    }
    format!("{:x}", md5::compute(canonical_json(&identity)))
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}
