/// WebSocket distribution edge: one actix actor per connection, forwarding
/// parsed requests to an async `Session` driver task over a channel so the
/// driver never blocks the actor's mailbox. Generalizes `web_server.rs`'s
/// `WsSession` (subscribe/unsubscribe/ping only) to the full action set in
/// the message-channel protocol, and replaces its direct session-state
/// mutation with message-passing per the callback-cycle redesign note.
use actix::prelude::*;
use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use clap::Parser;
use market_data_engine::acquisition::AcquisitionOrchestrator;
use market_data_engine::cache::BarCache;
use market_data_engine::config::Config;
use market_data_engine::model::Bar;
use market_data_engine::protocol::{BarWire, ClientRequest, ServerMessage};
use market_data_engine::session::{OutputSink, Session};
use market_data_engine::timeframe::SessionCalendar;
use market_data_engine::vendor::HttpWsVendorClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(about = "Market data distribution server")]
struct Args {
    #[arg(long)]
    db_path: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

struct AppState {
    cache: Arc<Mutex<BarCache>>,
    vendor: Arc<HttpWsVendorClient>,
    calendar: Arc<SessionCalendar>,
}

/// Sent from the async session driver to the actor to push text to the
/// client socket.
#[derive(Message)]
#[rtype(result = "()")]
struct OutboundText(String);

struct WsConnection {
    hb: Instant,
    request_tx: mpsc::UnboundedSender<ClientRequest>,
}

impl Actor for WsConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);
    }
}

impl WsConnection {
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Handler<OutboundText> for WsConnection {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsConnection {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(m) => m,
            Err(_) => {
                ctx.stop();
                return;
            }
        };
        match msg {
            ws::Message::Ping(bytes) => {
                self.hb = Instant::now();
                ctx.pong(&bytes);
            }
            ws::Message::Pong(_) => {
                self.hb = Instant::now();
            }
            ws::Message::Text(text) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(req) => {
                    if self.request_tx.send(req).is_err() {
                        ctx.stop();
                    }
                }
                Err(e) => {
                    let err = ServerMessage::Error {
                        message: format!("invalid request: {e}"),
                    };
                    if let Ok(json) = serde_json::to_string(&err) {
                        ctx.text(json);
                    }
                }
            },
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// `OutputSink` implementation forwarding bars as `ServerMessage::Data` to
/// the actor's mailbox, rendered in the client's requested timezone.
struct AddrSink {
    addr: Addr<WsConnection>,
    tz: chrono_tz::Tz,
}

#[async_trait::async_trait]
impl OutputSink for AddrSink {
    async fn emit_bar(&self, bar: &Bar) {
        let wire = BarWire {
            bar: bar.clone(),
            date_time: market_data_engine::protocol::render_date_time(bar.timestamp, &self.tz),
        };
        let msg = ServerMessage::Data { bar: wire };
        if let Ok(json) = serde_json::to_string(&msg) {
            self.addr.do_send(OutboundText(json));
        }
    }

    async fn emit_control(&self, message: &str) {
        let msg = ServerMessage::Ctrl {
            body: serde_json::json!({ "message": message }),
        };
        if let Ok(json) = serde_json::to_string(&msg) {
            self.addr.do_send(OutboundText(json));
        }
    }
}

async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<ClientRequest>();
    let connection = WsConnection {
        hb: Instant::now(),
        request_tx,
    };
    let (addr, resp) = ws::WsResponseBuilder::new(connection, &req, stream).start_with_addr()?;

    let cache = state.cache.clone();
    let vendor = state.vendor.clone();
    let calendar = state.calendar.clone();

    tokio::spawn(async move {
        let orchestrator = Arc::new(AcquisitionOrchestrator::new(cache, vendor));
        let sink = Arc::new(AddrSink {
            addr,
            tz: chrono_tz::UTC,
        });
        let mut session = Session::new(calendar, orchestrator, sink);

        loop {
            tokio::select! {
                req = request_rx.recv() => {
                    match req {
                        Some(req) => handle_request(&mut session, req).await,
                        None => break,
                    }
                }
                Some(trade) = session.recv_trade() => {
                    session.on_trade(trade).await;
                }
            }
        }
    });

    Ok(resp)
}

async fn handle_request<V, S>(session: &mut Session<V, S>, req: ClientRequest)
where
    V: market_data_engine::vendor::VendorClient,
    S: OutputSink,
{
    use market_data_engine::protocol::LiveData;

    match req {
        ClientRequest::SetClientId { clientid } => session.set_client_id(&clientid),
        ClientRequest::GetData {
            subscriptions,
            start_time,
            end_time,
            live_data,
            ..
        } => {
            let pairs: Vec<(String, String)> = subscriptions
                .into_iter()
                .map(|s| (s.instrument, s.timeframe))
                .collect();
            let now = chrono::Utc::now().timestamp_millis();
            let (start, end) = market_data_engine::protocol::resolve_get_data_range(
                start_time.as_deref(),
                end_time.as_deref(),
                now,
            );
            match live_data {
                LiveData::None => {
                    let _ = session.get_data_history_only(&pairs, start, end).await;
                }
                _ => {
                    let _ = session.get_data_live(&pairs, start, end).await;
                }
            }
        }
        ClientRequest::AddTimeframe { instrument, timeframe } => {
            let _ = session.add_timeframe(&instrument, &timeframe).await;
        }
        ClientRequest::RemoveTimeframe { instrument, timeframe } => {
            session.remove_timeframe(&instrument, &timeframe);
        }
        ClientRequest::StopData {} => {
            session.stop_data().await;
        }
        ClientRequest::GetReplay {
            subscriptions,
            history_start,
            live_start,
            live_end,
            replay_interval,
        } => {
            let pairs: Vec<(String, String)> = subscriptions
                .into_iter()
                .map(|s| (s.instrument, s.timeframe))
                .collect();
            let now = chrono::Utc::now().timestamp_millis();
            let history_start_ms = history_start.resolve(now);
            let live_start_ms = live_start.resolve(now);
            let live_end_ms = live_end.resolve(now, live_start_ms);
            let _ = session
                .get_replay(&pairs, history_start_ms, live_start_ms, live_end_ms, replay_interval)
                .await;
        }
        ClientRequest::ModifyReplay { pause, replay_interval } => {
            let _ = session.modify_replay(pause, replay_interval).await;
        }
        ClientRequest::StopReplay {} => {
            session.stop_replay().await;
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    let cache = Arc::new(Mutex::new(BarCache::open(&config.db_path)?));
    let vendor = Arc::new(HttpWsVendorClient::new(
        config.vendor_historical_url.clone(),
        config.vendor_ws_url.clone(),
        config.vendor_api_key.clone(),
    ));
    let calendar = Arc::new(SessionCalendar::new());

    let state = web::Data::new(AppState {
        cache,
        vendor,
        calendar,
    });

    let bind_addr = config.bind_addr.clone();
    let bind_port = config.bind_port;
    tracing::info!(addr = %bind_addr, port = bind_port, "starting market data server");

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .route("/ws", web::get().to(ws_index))
    })
    .bind((bind_addr.as_str(), bind_port))?
    .run()
    .await?;

    Ok(())
}
