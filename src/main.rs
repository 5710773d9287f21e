use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

// Generic normalized form of the upstream XML. The feed has no published
// schema, so the shape grows dynamically: a repeated element name promotes
// its values into a Sequence.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Scalar(String),
    Mapping(HashMap<String, Value>),
    Sequence(Vec<Value>),
}

impl Value {
    fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Mapping(map) => map.get(key),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(text) => Some(text),
            _ => None,
        }
    }

    // A repeated element normalizes to a Sequence, a lone one to itself.
    fn items(&self) -> &[Value] {
        match self {
            Value::Sequence(values) => values,
            other => std::slice::from_ref(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StopUpdate {
    stop_id: String,
    scheduled: DateTime<Utc>,
    estimated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct AvlTrip {
    vehicle_id: String,
    trip_id: String,
    lat: String,
    lon: String,
    last_updated: DateTime<Utc>,
    stop_updates: Vec<StopUpdate>,
}

#[derive(Debug, Clone, Serialize)]
struct TripPrediction {
    vehicle_id: String,
    trip_id: String,
    route: String,
    block: String,
    next_trip_id: String,
    last_updated: String,
    age_seconds: Option<i64>,
    lat_lon: String,
    schedule_deviation: String,
    next_stop_id: String,
    next_stop_pred: String,
    final_stop_id: String,
    final_stop_pred: String,
}

impl TripPrediction {
    fn placeholder(vehicle_id: &str) -> Self {
        TripPrediction {
            vehicle_id: vehicle_id.to_string(),
            trip_id: PLACEHOLDER.to_string(),
            route: PLACEHOLDER.to_string(),
            block: PLACEHOLDER.to_string(),
            next_trip_id: PLACEHOLDER.to_string(),
            last_updated: PLACEHOLDER.to_string(),
            age_seconds: None,
            lat_lon: PLACEHOLDER.to_string(),
            schedule_deviation: PLACEHOLDER.to_string(),
            next_stop_id: PLACEHOLDER.to_string(),
            next_stop_pred: PLACEHOLDER.to_string(),
            final_stop_id: PLACEHOLDER.to_string(),
            final_stop_pred: PLACEHOLDER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct MapPosition {
    lat: f64,
    lon: f64,
    vehicle_id: String,
}

#[derive(Debug, Default)]
struct MapState {
    position: Option<MapPosition>,
    pending: Option<JoinHandle<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone)]
struct AppState {
    client: reqwest::Client,
    feed_url: String,
    map: Arc<Mutex<MapState>>,
}

const DEFAULT_FEED_URL: &str =
    "http://localhost:9764/services/tss_lab/GetOnScheduleTrains?TimeInterval=5";
const PLACEHOLDER: &str = "...";
const UNAVAILABLE: &str = "N/A";
const MAP_LOAD_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let feed_url =
        std::env::var("AVL_FEED_URL").unwrap_or_else(|_| DEFAULT_FEED_URL.to_string());
    println!("Using AVL feed: {}", feed_url);

    let state = AppState {
        client: reqwest::Client::new(),
        feed_url,
        map: Arc::new(Mutex::new(MapState::default())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/vehicle/{vehicle_id}", get(get_vehicle_prediction))
        .route("/map", get(get_map_position))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3030")
        .await
        .unwrap();

    println!("Server is running on http://localhost:3030");
    axum::serve(listener, app).await.unwrap();
}

// Fetch the feed and render the requested vehicle's trip. Any failure in the
// refresh cycle (upstream down, bad XML, vehicle missing, empty trip) degrades
// to a placeholder prediction instead of an error status.
async fn get_vehicle_prediction(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> Json<TripPrediction> {
    match fetch_vehicle(&state, &vehicle_id).await {
        Ok(prediction) => {
            println!(
                "Prediction for vehicle {}: next stop {} ({})",
                vehicle_id, prediction.next_stop_id, prediction.schedule_deviation
            );
            Json(prediction)
        }
        Err(e) => {
            eprintln!("Refresh failed for vehicle {}: {}", vehicle_id, e);
            Json(TripPrediction::placeholder(&vehicle_id))
        }
    }
}

// Position published by the most recently completed map load.
async fn get_map_position(
    State(state): State<AppState>,
) -> Result<Json<MapPosition>, (StatusCode, Json<ErrorResponse>)> {
    let map = state.map.lock().await;
    match &map.position {
        Some(position) => Ok(Json(position.clone())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "no vehicle position loaded yet".to_string(),
            }),
        )),
    }
}

async fn fetch_vehicle(
    state: &AppState,
    raw_vehicle_id: &str,
) -> Result<TripPrediction, Box<dyn std::error::Error + Send + Sync>> {
    let body = state
        .client
        .get(&state.feed_url)
        .send()
        .await?
        .text()
        .await?;

    let doc = roxmltree::Document::parse(&body)?;
    let feed = normalize(doc.root_element());

    let trip = find_trip(&feed, raw_vehicle_id)
        .ok_or_else(|| format!("could not find vehicle '{}' in feed", raw_vehicle_id))?;

    let prediction = render_prediction(&trip, Utc::now())?;

    // The frontend map wants the position slightly after the text fields, so
    // the load is scheduled rather than published inline. A newer prediction
    // cancels a still-pending stale load.
    if let (Ok(lat), Ok(lon)) = (trip.lat.parse::<f64>(), trip.lon.parse::<f64>()) {
        schedule_map_load(
            state.map.clone(),
            MapPosition {
                lat,
                lon,
                vehicle_id: trip.vehicle_id.clone(),
            },
            MAP_LOAD_DELAY,
        )
        .await;
    }

    Ok(prediction)
}

// Convert an XML node into a Value:
// - no children: the node's text content ("" when absent)
// - one child: collapse to that child's normalized value
// - otherwise: a mapping keyed by child element name, where a repeated name
//   promotes its values into a Sequence in document order
//
// Known limitation: attributes and mixed text+element content are not
// represented, and a first child that itself normalized to a Sequence merges
// with later same-named siblings. The Link feed produces neither shape.
fn normalize(node: roxmltree::Node) -> Value {
    let mut children = node.children();
    let first = children.next();
    let second = children.next();

    match (first, second) {
        (None, _) => Value::Scalar(node.text().unwrap_or("").to_string()),
        (Some(only), None) => normalize(only),
        _ => {
            let mut map = HashMap::new();
            for child in node.children() {
                // skip comments and inter-element whitespace
                if !child.is_element() {
                    continue;
                }
                let name = child.tag_name().name().to_string();
                let value = normalize(child);
                match map.remove(&name) {
                    None => {
                        map.insert(name, value);
                    }
                    Some(Value::Sequence(mut seq)) => {
                        seq.push(value);
                        map.insert(name, Value::Sequence(seq));
                    }
                    Some(single) => {
                        map.insert(name, Value::Sequence(vec![single, value]));
                    }
                }
            }
            Value::Mapping(map)
        }
    }
}

// First stop update whose estimated arrival is strictly after `reference`,
// falling back to the last one when the vehicle is already past every stop.
// `stop_updates` must be sorted ascending by scheduled arrival. Returns None
// only for an empty slice.
fn select_next_stop<'a>(
    stop_updates: &'a [StopUpdate],
    reference: DateTime<Utc>,
) -> Option<&'a StopUpdate> {
    stop_updates
        .iter()
        .find(|update| update.estimated > reference)
        .or_else(|| stop_updates.last())
}

fn find_trip(feed: &Value, raw_vehicle_id: &str) -> Option<AvlTrip> {
    let wanted = hash_vehicle_id(raw_vehicle_id);
    feed.get("Trip")
        .map(Value::items)
        .unwrap_or(&[])
        .iter()
        .filter_map(parse_trip)
        .find(|trip| hash_vehicle_id(&trip.vehicle_id) == wanted)
}

fn parse_trip(value: &Value) -> Option<AvlTrip> {
    let vehicle_id = value.get("VehicleId")?.as_str()?.to_string();
    let last_updated = parse_avl_timestamp(value.get("LastUpdatedDate")?.as_str()?)?;

    let trip_id = value
        .get("TripId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let lat = value
        .get("Lat")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let lon = value
        .get("Lon")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut stop_updates = Vec::new();
    if let Some(updates) = value.get("StopUpdates") {
        // a StopUpdates element with a single Update collapses into the
        // update's own mapping, so fall back to the container itself
        let list = updates.get("Update").unwrap_or(updates);
        for item in list.items() {
            if let Some(update) = parse_stop_update(item) {
                stop_updates.push(update);
            }
        }
    }
    stop_updates.sort_by_key(|update| update.scheduled);

    Some(AvlTrip {
        vehicle_id,
        trip_id,
        lat,
        lon,
        last_updated,
        stop_updates,
    })
}

// Updates with an unparseable stop id or arrival time are dropped.
fn parse_stop_update(value: &Value) -> Option<StopUpdate> {
    let stop_id = value.get("StopId")?.as_str()?.to_string();
    let arrival = value.get("ArrivalTime")?;
    let scheduled = parse_avl_timestamp(arrival.get("Scheduled")?.as_str()?)?;
    let estimated = parse_avl_timestamp(arrival.get("Estimated")?.as_str()?)?;
    Some(StopUpdate {
        stop_id,
        scheduled,
        estimated,
    })
}

fn render_prediction(
    trip: &AvlTrip,
    now: DateTime<Utc>,
) -> Result<TripPrediction, Box<dyn std::error::Error + Send + Sync>> {
    let next_stop = select_next_stop(&trip.stop_updates, trip.last_updated)
        .ok_or("trip carried no stop updates")?;
    let final_stop = trip
        .stop_updates
        .last()
        .ok_or("trip carried no stop updates")?;

    let deviation_secs = (next_stop.estimated - next_stop.scheduled).num_seconds();

    Ok(TripPrediction {
        vehicle_id: trip.vehicle_id.clone(),
        trip_id: if trip.trip_id.is_empty() {
            UNAVAILABLE.to_string()
        } else {
            trip.trip_id.clone()
        },
        // the Link feed carries no route, block, or next-trip information
        route: UNAVAILABLE.to_string(),
        block: UNAVAILABLE.to_string(),
        next_trip_id: UNAVAILABLE.to_string(),
        last_updated: format_time(trip.last_updated),
        age_seconds: Some((now - trip.last_updated).num_seconds()),
        lat_lon: format!("{}, {}", trip.lat, trip.lon),
        schedule_deviation: format_schedule_deviation(deviation_secs),
        next_stop_id: next_stop.stop_id.clone(),
        next_stop_pred: format_time(next_stop.estimated),
        final_stop_id: final_stop.stop_id.clone(),
        final_stop_pred: format_time(final_stop.estimated),
    })
}

// Vehicle ids come out of the feed with their segments in unstable order
// ("161:163" vs "163:161"), so both sides are compared via a sorted rejoin.
fn hash_vehicle_id(vehicle_id: &str) -> String {
    let mut segments: Vec<&str> = vehicle_id.split(':').collect();
    segments.sort_unstable();
    segments.join(":")
}

fn parse_avl_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // older feed deployments emit naive zone-less timestamps
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(parsed.and_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%m/%d/%Y %I:%M:%S %p")
        .ok()
        .map(|parsed| parsed.and_utc())
}

fn format_time(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%H:%M:%S").to_string()
}

fn format_schedule_deviation(deviation_secs: i64) -> String {
    if deviation_secs == 0 {
        return "on time".to_string();
    }
    let label = if deviation_secs > 0 { "late" } else { "early" };
    let secs = deviation_secs.abs();
    if secs < 60 {
        format!("{}s {}", secs, label)
    } else if secs % 60 == 0 {
        format!("{}m {}", secs / 60, label)
    } else {
        format!("{}m {}s {}", secs / 60, secs % 60, label)
    }
}

// Publish `position` to the shared map state after `delay`, aborting any
// still-pending load so a stale position can never overwrite a newer one.
async fn schedule_map_load(map: Arc<Mutex<MapState>>, position: MapPosition, delay: Duration) {
    let mut state = map.lock().await;
    if let Some(pending) = state.pending.take() {
        pending.abort();
    }
    let map_clone = map.clone();
    let sleep = tokio::time::sleep(delay);
    state.pending = Some(tokio::spawn(async move {
        sleep.await;
        let mut state = map_clone.lock().await;
        state.position = Some(position);
        state.pending = None;
    }));
}
