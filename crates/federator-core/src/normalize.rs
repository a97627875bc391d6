//! Sanitizing raw collaborator replies into well-formed envelopes

use serde_json::Value;
use tracing::{error, info, warn};

use crate::message::{Envelope, LogLevel, Message};

/// Remove every null-valued object member, at any depth.
///
/// Nulls inside arrays are left alone; only keys are dropped.
pub fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// Turn one raw reply into an envelope and the status to record for it.
///
/// * a successful reply is stripped of nulls and parsed; if it carries no
///   message, or cannot be parsed, the minimal shape is substituted
/// * an error status keeps the request that was sent, filled out to the
///   minimal shape
/// * a lost query graph is restored from the request
///
/// A log entry describing the outcome is appended in every case.
pub fn normalize_reply(
    service: &str,
    job_id: &str,
    sent: &Envelope,
    status: u16,
    body: Option<Value>,
) -> (Envelope, u16) {
    let mut status = status;

    let mut envelope = if status == 200 {
        match body {
            Some(Value::Object(map)) if map.is_empty() => sent.clone(),
            Some(mut value) => {
                strip_nulls(&mut value);
                if value.get("message").is_some_and(Value::is_object) {
                    match serde_json::from_value::<Envelope>(value) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            error!(job_id = %job_id, service = %service, error = %e, "Malformed reply");
                            status = 500;
                            minimal(sent)
                        }
                    }
                } else {
                    minimal(sent)
                }
            }
            None => {
                error!(job_id = %job_id, service = %service, "Reply body is not JSON");
                status = 500;
                minimal(sent)
            }
        }
    } else {
        let mut kept = sent.clone();
        kept.message.knowledge_graph.get_or_insert_with(Default::default);
        kept.message.results.get_or_insert_with(Vec::new);
        kept
    };

    if envelope.message.query_graph.is_none() {
        envelope.message.query_graph = sent.message.query_graph.clone();
    }

    if status != 200 {
        let msg = format!("{} HTML error status code {} returned.", service, status);
        error!(job_id = %job_id, "{}", msg);
        envelope.push_log(LogLevel::Error, msg);
    } else if envelope.message.results().is_empty() {
        let msg = format!("{} No results returned.", service);
        warn!(job_id = %job_id, "{}", msg);
        envelope.push_log(LogLevel::Warning, msg);
    } else {
        info!(
            job_id = %job_id,
            service = %service,
            results = envelope.message.results().len(),
            "Service returned results"
        );
    }

    (envelope, status)
}

fn minimal(sent: &Envelope) -> Envelope {
    Envelope {
        message: Message::minimal(sent.message.query_graph.clone()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sent() -> Envelope {
        serde_json::from_value(json!({"message": {"query_graph": {
            "nodes": {"a": {"ids": ["X:1"]}, "b": {}},
            "edges": {"e": {"subject": "a", "object": "b"}}
        }}}))
        .unwrap()
    }

    #[test]
    fn test_strip_nulls_recursive() {
        let mut value = json!({
            "a": null,
            "b": {"c": null, "d": 1, "e": [{"f": null, "g": 2}, null]},
        });
        strip_nulls(&mut value);
        assert_eq!(value, json!({"b": {"d": 1, "e": [{"g": 2}, null]}}));
    }

    #[test]
    fn test_reattaches_query_graph() {
        let body = json!({"message": {
            "query_graph": null,
            "knowledge_graph": {"nodes": {}, "edges": {}},
            "results": [{"node_bindings": {"a": [{"id": "X:1"}]}, "analyses": []}]
        }});
        let (env, status) = normalize_reply("strider", "job", &sent(), 200, Some(body));
        assert_eq!(status, 200);
        assert_eq!(env.query_graph(), sent().query_graph());
        assert_eq!(env.result_count(), 1);
        assert!(env.logs.is_empty());
    }

    #[test]
    fn test_missing_message_becomes_minimal() {
        let (env, status) =
            normalize_reply("strider", "job", &sent(), 200, Some(json!({"detail": "oops"})));
        assert_eq!(status, 200);
        assert_eq!(env.message.results.as_deref(), Some(&[][..]));
        assert!(env.message.knowledge_graph.is_some());
        assert_eq!(env.logs[0].message, "strider No results returned.");
        assert_eq!(env.logs[0].level.as_deref(), Some("WARNING"));
    }

    #[test]
    fn test_error_status_logs_error() {
        let (env, status) = normalize_reply("score", "job", &sent(), 502, None);
        assert_eq!(status, 502);
        assert_eq!(env.logs.len(), 1);
        assert_eq!(env.logs[0].message, "score HTML error status code 502 returned.");
        assert_eq!(env.logs[0].level.as_deref(), Some("ERROR"));
        assert!(env.message.results.is_some());
    }

    #[test]
    fn test_unparseable_success_is_500() {
        let (env, status) = normalize_reply("strider", "job", &sent(), 200, None);
        assert_eq!(status, 500);
        assert_eq!(env.result_count(), 0);

        let malformed = json!({"message": {"results": "not a list"}});
        let (_, status) = normalize_reply("strider", "job", &sent(), 200, Some(malformed));
        assert_eq!(status, 500);
    }

    #[test]
    fn test_keeps_reply_logs() {
        let body = json!({"message": {"results": []}, "logs": [{"timestamp": "t", "message": "upstream note"}]});
        let (env, _) = normalize_reply("strider", "job", &sent(), 200, Some(body));
        assert_eq!(env.logs.len(), 2);
        assert_eq!(env.logs[0].message, "upstream note");
    }
}
