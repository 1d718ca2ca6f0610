//! Example native plugin.
//!
//! Build with `cargo build -p plinth-example-weather --release` and copy the
//! resulting `libweather.so` (`weather.dll`, `libweather.dylib`) into the
//! host's plugin directory. The file stem must match the manifest id, so
//! rename it to `weather.so` on Unix.

use plinth_sdk::serde_json::json;
use plinth_sdk::{
    export_handler, export_plugin, ManifestDocument, RequestEnvelope, ResponseEnvelope,
    RouteDeclaration,
};

/// Longest forecast served, in days.
const MAX_FORECAST_DAYS: u32 = 7;

const CONDITIONS: [&str; 4] = ["sunny", "cloudy", "rain", "wind"];

fn manifest() -> ManifestDocument {
    ManifestDocument {
        id: "weather".to_string(),
        name: "Weather".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: Some("Current conditions and a short forecast".to_string()),
        author: Some("Plinth contributors".to_string()),
        bundle: true,
        bundle_content_type: None,
        routes: vec![
            RouteDeclaration::new("GET", "/weather/now", "weather_now"),
            RouteDeclaration::new("POST", "/weather/refresh", "weather_refresh"),
            RouteDeclaration::new("GET", "/weather/forecast/:days", "weather_forecast"),
            RouteDeclaration::new("POST", "/weather/report", "weather_report"),
        ],
    }
}

fn json_response(status: u16, value: plinth_sdk::serde_json::Value) -> ResponseEnvelope {
    ResponseEnvelope::json(status, &value)
        .unwrap_or_else(|e| ResponseEnvelope::text(500, e.to_string()))
}

fn now(req: RequestEnvelope) -> ResponseEnvelope {
    let body = match req.query_param("units") {
        Some("imperial") => json!({ "conditions": "sunny", "temperature_f": 70 }),
        _ => json!({ "conditions": "sunny", "temperature_c": 21 }),
    };
    json_response(200, body)
}

fn forecast(req: RequestEnvelope) -> ResponseEnvelope {
    let days = match req.param("days").map(str::parse::<u32>) {
        Some(Ok(days)) if (1..=MAX_FORECAST_DAYS).contains(&days) => days,
        _ => {
            return json_response(
                400,
                json!({ "error": format!("days must be between 1 and {MAX_FORECAST_DAYS}") }),
            )
        }
    };
    let outlook: Vec<_> = (0..days)
        .map(|day| {
            json!({
                "day": day + 1,
                "conditions": CONDITIONS[day as usize % CONDITIONS.len()],
            })
        })
        .collect();
    json_response(200, json!({ "days": days, "outlook": outlook }))
}

/// Queues a refresh of the cached conditions. An optional JSON body may name
/// the `station` to refresh; the default station is used otherwise.
fn refresh(req: RequestEnvelope) -> ResponseEnvelope {
    if req.body.is_empty() {
        return json_response(202, json!({ "refreshing": "default" }));
    }
    match plinth_sdk::serde_json::from_slice::<plinth_sdk::serde_json::Value>(&req.body) {
        Ok(options) => {
            let station = options
                .get("station")
                .and_then(|s| s.as_str())
                .unwrap_or("default")
                .to_string();
            json_response(202, json!({ "refreshing": station }))
        }
        Err(e) => json_response(400, json!({ "error": e.to_string() })),
    }
}

/// Accepts a JSON observation and acknowledges it.
fn report(req: RequestEnvelope) -> ResponseEnvelope {
    match plinth_sdk::serde_json::from_slice::<plinth_sdk::serde_json::Value>(&req.body) {
        Ok(observation) if observation.get("conditions").is_some() => {
            json_response(202, json!({ "accepted": observation["conditions"] }))
        }
        Ok(_) => json_response(422, json!({ "error": "missing field `conditions`" })),
        Err(e) => json_response(400, json!({ "error": e.to_string() })),
    }
}

export_plugin!(manifest: manifest(), bundle: include_bytes!("../ui/index.js"));
export_handler!(weather_now => now);
export_handler!(weather_refresh => refresh);
export_handler!(weather_forecast => forecast);
export_handler!(weather_report => report);

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_sdk::{PlinthBuffer, ABI_VERSION};

    fn call(
        handler: unsafe extern "C-unwind" fn(*const u8, usize) -> PlinthBuffer,
        request: RequestEnvelope,
    ) -> ResponseEnvelope {
        let bytes = request.encode().unwrap();
        let buf = unsafe { handler(bytes.as_ptr(), bytes.len()) };
        let response = ResponseEnvelope::decode(unsafe { buf.as_slice() }.unwrap()).unwrap();
        unsafe { plinth_buffer_free(buf) };
        response
    }

    fn body_json(response: &ResponseEnvelope) -> plinth_sdk::serde_json::Value {
        plinth_sdk::serde_json::from_slice(&response.body).unwrap()
    }

    // ── Exported entry points ────────────────────────────────────────

    #[test]
    fn test_manifest_export() {
        let buf = plinth_manifest_v1();
        let bytes = unsafe { buf.as_slice() }.unwrap().to_vec();
        unsafe { plinth_buffer_free(buf) };

        let (header, document) = ManifestDocument::decode(&bytes, ABI_VERSION).unwrap();
        assert_eq!(header.version, ABI_VERSION);
        assert_eq!(header.release, plinth_sdk::ReleaseMode::Exported);
        assert_eq!(document.id, "weather");
        assert!(document.bundle);
        assert_eq!(document.routes.len(), 4);
        assert!(document
            .routes
            .iter()
            .any(|r| r.method == "POST" && r.path == "/weather/refresh" && r.symbol == "weather_refresh"));
    }

    #[test]
    fn test_bundle_export() {
        assert!(plinth_has_bundle());
        let buf = plinth_bundle();
        let bytes = unsafe { buf.as_slice() }.unwrap();
        assert_eq!(bytes, include_bytes!("../ui/index.js"));
    }

    // ── Handlers ─────────────────────────────────────────────────────

    #[test]
    fn test_now() {
        let response = call(weather_now, RequestEnvelope::new("GET", "/weather/now"));
        assert_eq!(response.status, 200);
        let json = body_json(&response);
        assert_eq!(json["conditions"], "sunny");
        assert_eq!(json["temperature_c"], 21);

        let response = call(
            weather_now,
            RequestEnvelope::new("GET", "/weather/now").with_query("units", "imperial"),
        );
        assert_eq!(body_json(&response)["temperature_f"], 70);
    }

    #[test]
    fn test_forecast() {
        let mut request = RequestEnvelope::new("GET", "/weather/forecast/3");
        request.params.insert("days".into(), "3".into());
        let response = call(weather_forecast, request);
        assert_eq!(response.status, 200);
        let json = body_json(&response);
        assert_eq!(json["outlook"].as_array().unwrap().len(), 3);
        assert_eq!(json["outlook"][1]["conditions"], "cloudy");
    }

    #[test]
    fn test_forecast_rejects_bad_days() {
        for days in ["0", "8", "soon"] {
            let mut request = RequestEnvelope::new("GET", "/weather/forecast/x");
            request.params.insert("days".into(), days.into());
            assert_eq!(call(weather_forecast, request).status, 400, "{days}");
        }
    }

    #[test]
    fn test_refresh() {
        let response = call(weather_refresh, RequestEnvelope::new("POST", "/weather/refresh"));
        assert_eq!(response.status, 202);
        assert_eq!(body_json(&response)["refreshing"], "default");

        let response = call(
            weather_refresh,
            RequestEnvelope::new("POST", "/weather/refresh")
                .with_body(br#"{"station":"harbour"}"#.to_vec()),
        );
        assert_eq!(response.status, 202);
        assert_eq!(body_json(&response)["refreshing"], "harbour");

        let response = call(
            weather_refresh,
            RequestEnvelope::new("POST", "/weather/refresh").with_body(b"{".to_vec()),
        );
        assert_eq!(response.status, 400);
    }

    #[test]
    fn test_report() {
        let accepted = call(
            weather_report,
            RequestEnvelope::new("POST", "/weather/report").with_body(br#"{"conditions":"hail"}"#.to_vec()),
        );
        assert_eq!(accepted.status, 202);
        assert_eq!(body_json(&accepted)["accepted"], "hail");

        let incomplete = call(
            weather_report,
            RequestEnvelope::new("POST", "/weather/report").with_body(b"{}".to_vec()),
        );
        assert_eq!(incomplete.status, 422);

        let garbage = call(
            weather_report,
            RequestEnvelope::new("POST", "/weather/report").with_body(b"not json".to_vec()),
        );
        assert_eq!(garbage.status, 400);
    }

    #[test]
    fn test_malformed_request_is_400() {
        let bytes = b"definitely not an envelope";
        let buf = unsafe { weather_now(bytes.as_ptr(), bytes.len()) };
        let response = ResponseEnvelope::decode(unsafe { buf.as_slice() }.unwrap()).unwrap();
        unsafe { plinth_buffer_free(buf) };
        assert_eq!(response.status, 400);
    }
}
