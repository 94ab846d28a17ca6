use axum::{
    extract::{Json, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::{simulate_with, RunOptions, Scenario, SimulationError, SimulationResult};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateQuery {
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceInfo {
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router();

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP API listening");

    axum::serve(listener, app).await
}

fn router() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/default_scenario", get(default_scenario_handler))
        .route("/api/simulate", axum::routing::post(simulate_handler))
        .fallback(not_found_handler)
}

async fn root_handler() -> Response {
    json_response(
        StatusCode::OK,
        ServiceInfo {
            service: "nestegg",
            version: env!("CARGO_PKG_VERSION"),
        },
    )
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, Health { status: "ok" })
}

async fn default_scenario_handler() -> Response {
    json_response(StatusCode::OK, Scenario::default())
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(
    Query(query): Query<SimulateQuery>,
    Json(scenario): Json<Scenario>,
) -> Response {
    match run_simulation(&scenario, query.seed) {
        Ok(result) => json_response(StatusCode::OK, result),
        Err(err) => error_response(error_status(&err), &err.to_string()),
    }
}

fn run_simulation(
    scenario: &Scenario,
    seed: Option<u64>,
) -> Result<SimulationResult, SimulationError> {
    let options = RunOptions {
        seed,
        ..RunOptions::default()
    };
    simulate_with(scenario, &options)
}

fn error_status(err: &SimulationError) -> StatusCode {
    match err {
        SimulationError::Validation(_) => StatusCode::BAD_REQUEST,
        SimulationError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        SimulationError::Numerical(_) | SimulationError::Internal { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_from_json(json: &str) -> Result<Scenario, String> {
        serde_json::from_str::<Scenario>(json).map_err(|e| format!("invalid scenario JSON: {e}"))
    }

    #[test]
    fn default_scenario_serializes_with_camel_case_keys() {
        let json = serde_json::to_string(&Scenario::default()).expect("serialize");
        assert!(json.contains("\"currentAge\""));
        assert!(json.contains("\"endAge\""));
        assert!(json.contains("\"blackSwan\""));
        assert!(json.contains("\"expRet\""));
    }

    #[test]
    fn simulate_json_payload_round_trips_through_the_kernel() {
        let json = r#"{
          "currentAge": 60,
          "endAge": 70,
          "nSims": 200,
          "accounts": [{ "kind": "IRA", "balance": 800000, "stocks": 0.5, "bonds": 0.5 }],
          "spending": { "baseAnnual": 40000, "reducedAnnual": 40000, "reduceAtAge": 60, "inflation": 0.02 },
          "cma": { "fatTails": false }
        }"#;
        let scenario = scenario_from_json(json).expect("parse");
        let result = run_simulation(&scenario, Some(7)).expect("simulate");
        assert_eq!(result.ages.first(), Some(&60));
        assert_eq!(result.ages.last(), Some(&70));
        assert_eq!(result.p50.len(), 11);
    }

    #[test]
    fn validation_failures_map_to_bad_request() {
        let mut scenario = Scenario::default();
        scenario.end_age = scenario.current_age - 1;
        let err = run_simulation(&scenario, None).expect_err("invalid scenario");
        assert_eq!(error_status(&err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn cancellation_maps_to_request_timeout() {
        assert_eq!(
            error_status(&SimulationError::Cancelled),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            error_status(&SimulationError::numerical("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn fixed_seed_gives_stable_api_results() {
        let mut scenario = Scenario::default();
        scenario.cma.fat_tails = false;
        scenario.n_sims = 500;
        let a = run_simulation(&scenario, Some(42)).expect("run a");
        let b = run_simulation(&scenario, Some(42)).expect("run b");
        assert_eq!(
            serde_json::to_string(&a).expect("a"),
            serde_json::to_string(&b).expect("b")
        );
    }
}
