use serde::Deserialize;
use serde_json::Value;

use super::{parse_payload, required, respond};
use crate::auth::Capability;
use crate::models::ReferenceKind;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPayload {
    #[serde(alias = "entity", alias = "type")]
    kind: String,
    #[serde(default, alias = "query", alias = "q", alias = "search")]
    term: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindOrCreatePayload {
    #[serde(alias = "entity", alias = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    details: Value,
}

fn parse_kind(raw: &str) -> Result<ReferenceKind, String> {
    raw.parse::<ReferenceKind>().map_err(|e| e.to_string())
}

fn parse_search_payload(arg0: Option<Value>) -> Result<(ReferenceKind, String), String> {
    let parsed: SearchPayload = parse_payload(arg0.unwrap_or(Value::Null), "reference search")?;
    Ok((parse_kind(&parsed.kind)?, parsed.term.trim().to_string()))
}

fn parse_find_or_create_payload(
    arg0: Option<Value>,
) -> Result<(ReferenceKind, String, Value), String> {
    let parsed: FindOrCreatePayload = parse_payload(arg0.unwrap_or(Value::Null), "reference")?;
    let details = match parsed.details {
        Value::Null => serde_json::json!({}),
        v @ Value::Object(_) => v,
        _ => return Err("Reference details must be an object".into()),
    };
    Ok((parse_kind(&parsed.kind)?, required(parsed.name, "name")?, details))
}

/// Capability needed to add a new row of `kind`.
fn create_capability(kind: ReferenceKind) -> Capability {
    match kind {
        ReferenceKind::Customer => Capability::ManageCustomers,
        _ => Capability::CreateJobOrders,
    }
}

pub async fn reference_search(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let (kind, term) = parse_search_payload(arg0)?;
    Ok(respond(
        "reference_search",
        "items",
        state.sync.search_references(kind, &term).await,
    ))
}

pub async fn reference_find_or_create(
    state: &AppState,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let (kind, name, details) = parse_find_or_create_payload(arg0)?;
    let result = match state.claims().require(create_capability(kind)) {
        Ok(()) => state.sync.find_or_create_reference(kind, &name, &details).await,
        Err(e) => Err(e),
    };
    Ok(respond("reference_find_or_create", "item", result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayUser;
    use crate::test_support::app_state;
    use serde_json::json;

    async fn sign_in(state: &AppState, role: &str) {
        state
            .roles
            .resolve(Some(&GatewayUser {
                id: "u-1".into(),
                email: None,
                claims: json!({ "role": role }),
            }))
            .await;
    }

    #[test]
    fn payloads_validate_kind_and_name() {
        let (kind, term) =
            parse_search_payload(Some(json!({"entity": "customers", "q": " acme "}))).unwrap();
        assert_eq!(kind, ReferenceKind::Customer);
        assert_eq!(term, "acme");
        assert!(parse_search_payload(Some(json!({"kind": "printers"}))).is_err());

        let (kind, name, details) =
            parse_find_or_create_payload(Some(json!({"type": "job_title", "name": "Banner"})))
                .unwrap();
        assert_eq!(kind, ReferenceKind::JobTitle);
        assert_eq!(name, "Banner");
        assert_eq!(details, json!({}));
        assert!(parse_find_or_create_payload(Some(
            json!({"kind": "designer", "name": "A", "details": [1]})
        ))
        .is_err());
    }

    #[tokio::test]
    async fn designers_cannot_create_customers() {
        let (gateway, state) = app_state();
        sign_in(&state, "designer").await;
        let body = reference_find_or_create(
            &state,
            Some(json!({"kind": "customer", "name": "Acme Print"})),
        )
        .await
        .unwrap();
        assert_eq!(body["code"], "access_denied");
        assert_eq!(gateway.call_count("insert:"), 0);
    }

    #[tokio::test]
    async fn salesman_creates_customer_then_finds_it() {
        let (gateway, state) = app_state();
        sign_in(&state, "salesman").await;
        let payload = json!({"kind": "customer", "name": "Acme Print", "details": {"phone": "555"}});

        let created = reference_find_or_create(&state, Some(payload.clone())).await.unwrap();
        assert_eq!(created["success"], true);
        assert_eq!(created["item"]["name"], "Acme Print");

        let again = reference_find_or_create(&state, Some(payload)).await.unwrap();
        assert_eq!(again["item"]["id"], created["item"]["id"]);
        assert_eq!(gateway.call_count("insert:customers"), 1);

        let found = reference_search(&state, Some(json!({"kind": "customer", "term": "acme"})))
            .await
            .unwrap();
        assert_eq!(found["items"].as_array().unwrap().len(), 1);
    }
}
