//! RPC parameter extraction macros
//!
//! Reduces boilerplate in request handlers. The `require_*` macros return
//! early from the enclosing handler with an `INVALID_PARAMS` response when
//! the parameter is missing or has the wrong type.

/// Extract a required string parameter from a request.
///
/// # Example
///
/// ```ignore
/// let path = require_str_param!(req, "path");
/// // `path` is now &str, or the handler returned early with an error
/// ```
#[macro_export]
macro_rules! require_str_param {
    ($req:expr, $name:literal) => {
        match $req.params.get($name).and_then(|v| v.as_str()) {
            Some(v) => v,
            None => {
                return ::filebro_protocol::Response::failure(
                    $req.id.clone(),
                    ::filebro_protocol::INVALID_PARAMS,
                    ::filebro_protocol::Reason::InvalidParameters,
                    concat!("Missing or invalid '", $name, "' parameter"),
                )
            }
        }
    };
}

/// Extract an optional string parameter. `None` when missing or not a string.
#[macro_export]
macro_rules! optional_str_param {
    ($req:expr, $name:literal) => {
        $req.params.get($name).and_then(|v| v.as_str())
    };
}

/// Extract a required u64 parameter from a request.
///
/// # Example
///
/// ```ignore
/// let task_id = require_u64_param!(req, "task_id");
/// ```
#[macro_export]
macro_rules! require_u64_param {
    ($req:expr, $name:literal) => {
        match $req.params.get($name).and_then(|v| v.as_u64()) {
            Some(v) => v,
            None => {
                return ::filebro_protocol::Response::failure(
                    $req.id.clone(),
                    ::filebro_protocol::INVALID_PARAMS,
                    ::filebro_protocol::Reason::InvalidParameters,
                    concat!(
                        "Missing or invalid '",
                        $name,
                        "' parameter (expected unsigned integer)"
                    ),
                )
            }
        }
    };
}

/// Extract an optional object-or-null parameter as an owned `Value`,
/// defaulting to an empty object.
#[macro_export]
macro_rules! optional_obj_param {
    ($req:expr, $name:literal) => {
        match $req.params.get($name) {
            None | Some(::serde_json::Value::Null) => ::serde_json::json!({}),
            Some(v) if v.is_object() => v.clone(),
            Some(_) => {
                return ::filebro_protocol::Response::failure(
                    $req.id.clone(),
                    ::filebro_protocol::INVALID_PARAMS,
                    ::filebro_protocol::Reason::InvalidParameters,
                    concat!("Parameter '", $name, "' must be an object"),
                )
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use filebro_protocol::{Reason, Request, Response, INVALID_PARAMS};
    use serde_json::json;

    fn path_of(req: &Request) -> Response {
        let path = require_str_param!(req, "path");
        Response::success(req.id.clone(), path)
    }

    fn task_of(req: &Request) -> Response {
        let id = require_u64_param!(req, "task_id");
        Response::success(req.id.clone(), id)
    }

    fn params_of(req: &Request) -> Response {
        let params = optional_obj_param!(req, "params");
        Response::success(req.id.clone(), params)
    }

    #[test]
    fn test_require_str_param() {
        let ok = path_of(&Request::new(1, "stat", json!({"path": "/tmp"})));
        assert_eq!(ok.result, Some(json!("/tmp")));

        let err = path_of(&Request::new(2, "stat", json!({"path": 3})));
        let error = err.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.reason(), Some(Reason::InvalidParameters));
        assert!(error.message.contains("'path'"));
    }

    #[test]
    fn test_require_u64_param() {
        assert!(task_of(&Request::new(1, "x", json!({"task_id": 4}))).is_success());
        assert!(!task_of(&Request::new(1, "x", json!({"task_id": -4}))).is_success());
        assert!(!task_of(&Request::new(1, "x", json!(null))).is_success());
    }

    #[test]
    fn test_optional_str_param() {
        let req = Request::new(1, "navigate", json!({}));
        assert_eq!(optional_str_param!(req, "path"), None);
    }

    #[test]
    fn test_optional_obj_param() {
        let missing = params_of(&Request::new(1, "x", json!({})));
        assert_eq!(missing.result, Some(json!({})));

        let given = params_of(&Request::new(1, "x", json!({"params": {"path": "/a"}})));
        assert_eq!(given.result, Some(json!({"path": "/a"})));

        assert!(!params_of(&Request::new(1, "x", json!({"params": [1]}))).is_success());
    }
}
