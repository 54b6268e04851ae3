use std::{io::Read, path::Path, sync::Arc};

use rouille::{Request, Response, Server};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{runtime::Handle, sync::broadcast::error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    error::SessionError,
    model::candidate::IceCandidate,
    pipeline::CommandLauncher,
    session::SessionController,
};

#[derive(Debug, Deserialize)]
struct OfferRequest {
    offer: SessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionDescription {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    sdp: String,
}

#[derive(Debug, Serialize)]
struct OfferResponse {
    answer: SessionDescription,
}

#[derive(Debug, Deserialize)]
struct CandidateRequest {
    candidate: IceCandidate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CandidateResponse {
    ice_candidates: Vec<IceCandidate>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn init_log() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

pub fn main(config_path: Option<&Path>) -> anyhow::Result<()> {
    init_log();

    let config = Config::load(config_path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let launcher = Arc::new(CommandLauncher::new(&config));
    let http_addr = config.http_addr;
    let controller = Arc::new(SessionController::new(config, launcher)?);

    runtime.spawn(log_events(controller.clone()));

    let handle = runtime.handle().clone();
    let server = Server::new(http_addr, move |request| {
        web_request(request, &controller, &handle)
    })
    .map_err(|e| anyhow::anyhow!("starting the web server: {e}"))?;

    info!("Signaling on http://{}", server.server_addr());

    server.run();
    Ok(())
}

/// Surface session events in the log.
async fn log_events(controller: Arc<SessionController>) {
    let mut events = controller.subscribe();

    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!("Session event: {}", json),
                Err(e) => warn!("Unserialisable session event {:?}: {}", event, e),
            },
            Err(RecvError::Lagged(n)) => warn!("Event log skipped {} events", n),
            Err(RecvError::Closed) => return,
        }
    }
}

fn web_request(request: &Request, controller: &SessionController, rt: &Handle) -> Response {
    debug!("{} {}", request.method(), request.url());

    let response = match (request.method(), request.url().as_str()) {
        ("OPTIONS", _) => Response::empty_204(),
        ("POST", "/send_offer") => send_offer(request, controller, rt),
        ("POST", "/send_ice_candidate") => send_ice_candidate(request, controller, rt),
        ("POST", "/close") => {
            let state = rt.block_on(controller.close());
            Response::json(&serde_json::json!({ "state": state }))
        }
        ("GET", "/session") => Response::json(&controller.status()),
        _ => Response::empty_404(),
    };

    with_cors(response)
}

fn with_cors(response: Response) -> Response {
    response
        .with_additional_header("Access-Control-Allow-Origin", "*")
        .with_additional_header("Access-Control-Allow-Methods", "GET,POST")
        .with_additional_header("Access-Control-Allow-Headers", "Content-Type")
}

fn send_offer(request: &Request, controller: &SessionController, rt: &Handle) -> Response {
    let body: OfferRequest = match read_json(request) {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    match rt.block_on(controller.apply_remote_offer(&body.offer.sdp)) {
        Ok(sdp) => {
            info!("Answer:\n{}", sdp);
            Response::json(&OfferResponse {
                answer: SessionDescription {
                    kind: Some("answer".to_string()),
                    sdp,
                },
            })
        }
        Err(e) => {
            warn!("Error sending offer: {}", e);
            error_response(&e)
        }
    }
}

fn send_ice_candidate(request: &Request, controller: &SessionController, rt: &Handle) -> Response {
    let body: CandidateRequest = match read_json(request) {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    match rt.block_on(controller.add_remote_ice_candidate(&body.candidate)) {
        Ok(()) => Response::json(&CandidateResponse {
            ice_candidates: controller.list_local_candidates(),
        }),
        Err(e) => {
            warn!("Error adding ICE candidate: {}", e);
            error_response(&e)
        }
    }
}

fn read_json<T: DeserializeOwned>(request: &Request) -> Result<T, SessionError> {
    let mut data = request
        .data()
        .ok_or_else(|| SessionError::Negotiation("request body already consumed".into()))?;

    let mut body = Vec::new();
    data.read_to_end(&mut body)
        .map_err(|e| SessionError::Negotiation(format!("reading request body: {e}")))?;

    serde_json::from_slice(&body)
        .map_err(|e| SessionError::Negotiation(format!("malformed request body: {e}")))
}

fn error_response(e: &SessionError) -> Response {
    Response::json(&ErrorBody {
        error: e.kind(),
        message: e.to_string(),
    })
    .with_status_code(500)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::runtime::Runtime;

    use super::*;
    use crate::session::tests::{controller, offer_sdp, remote_candidate, test_config};

    fn post(url: &str, body: Value) -> Request {
        Request::fake_http(
            "POST",
            url,
            vec![("Content-Type".into(), "application/json".into())],
            serde_json::to_vec(&body).unwrap(),
        )
    }

    fn call(request: Request, controller: &SessionController, rt: &Runtime) -> (u16, Value) {
        let response = web_request(&request, controller, rt.handle());
        let status = response.status_code;

        let (mut reader, _) = response.data.into_reader_and_size();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();

        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).unwrap()
        };
        (status, json)
    }

    #[test]
    fn offer_then_candidate_end_to_end() {
        let rt = Runtime::new().unwrap();
        let controller = controller(test_config());

        let (status, body) = call(
            post("/send_offer", json!({ "offer": { "type": "offer", "sdp": offer_sdp() } })),
            &controller,
            &rt,
        );
        assert_eq!(status, 200);
        assert_eq!(body["answer"]["type"], "answer");
        let sdp = body["answer"]["sdp"].as_str().unwrap();
        assert!(sdp.contains("a=group:BUNDLE 0"));

        let (status, body) = call(
            post(
                "/send_ice_candidate",
                json!({ "candidate": serde_json::to_value(remote_candidate()).unwrap() }),
            ),
            &controller,
            &rt,
        );
        assert_eq!(status, 200);
        let candidates = body["iceCandidates"].as_array().unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0]["candidate"]
            .as_str()
            .unwrap()
            .starts_with("candidate:"));

        let (status, body) = call(post("/close", json!({})), &controller, &rt);
        assert_eq!(status, 200);
        assert_eq!(body["state"], "closed");
    }

    #[test]
    fn candidate_without_session_fails() {
        let rt = Runtime::new().unwrap();
        let controller = controller(test_config());

        let (status, body) = call(
            post(
                "/send_ice_candidate",
                json!({ "candidate": { "candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host" } }),
            ),
            &controller,
            &rt,
        );
        assert_eq!(status, 500);
        assert_eq!(body["error"], "session_not_ready");
    }

    #[test]
    fn second_offer_fails_with_state_conflict() {
        let rt = Runtime::new().unwrap();
        let controller = controller(test_config());
        let offer = json!({ "offer": { "sdp": offer_sdp() } });

        let (status, _) = call(post("/send_offer", offer.clone()), &controller, &rt);
        assert_eq!(status, 200);

        let (status, body) = call(post("/send_offer", offer), &controller, &rt);
        assert_eq!(status, 500);
        assert_eq!(body["error"], "state_conflict");

        rt.block_on(controller.close());
    }

    #[test]
    fn malformed_body_is_rejected() {
        let rt = Runtime::new().unwrap();
        let controller = controller(test_config());

        let (status, body) = call(post("/send_offer", json!({ "sdp": "v=0" })), &controller, &rt);
        assert_eq!(status, 500);
        assert_eq!(body["error"], "negotiation");
    }

    #[test]
    fn answers_preflight_and_status_with_cors() {
        let rt = Runtime::new().unwrap();
        let controller = controller(test_config());

        let preflight = Request::fake_http("OPTIONS", "/send_offer", vec![], vec![]);
        let response = web_request(&preflight, &controller, rt.handle());
        assert_eq!(response.status_code, 204);
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| k == "Access-Control-Allow-Origin" && v == "*"));

        let status = Request::fake_http("GET", "/session", vec![], vec![]);
        let (code, body) = call(status, &controller, &rt);
        assert_eq!(code, 200);
        assert_eq!(body["state"], "created");
        assert_eq!(body["streams"].as_array().unwrap().len(), 3);

        let missing = Request::fake_http("GET", "/nope", vec![], vec![]);
        assert_eq!(web_request(&missing, &controller, rt.handle()).status_code, 404);
    }
}
