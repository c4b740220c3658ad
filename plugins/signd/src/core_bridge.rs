use crate::{
    api::{self, AppState},
    housekeeping::{self, CLEANUP_TIMER_ID},
};
use anyhow::Result;
use plugin_api::{read, send, Envelope, Kind, Metadata, TimerParams, TimerTick};
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader, BufWriter};
use tracing::{debug, error, info, warn};

pub fn metadata() -> Metadata {
    Metadata {
        id: "signd".into(),
        name: "signd Signing".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        needs: vec![
            "log".into(),
            "event".into(),
            "timer".into(),
            "storage".into(),
        ],
    }
}

/// Run the stdio protocol with the core, serving HTTP in the background.
pub async fn run_stdio(state: AppState) -> Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    let writer = BufWriter::new(tokio::io::stdout());

    let server_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run_http_server(server_state).await {
            error!(error = %e, "http server stopped");
        }
    });

    serve(reader, writer, state).await
}

/// Send a request and wait for its response. Whatever else the core sends
/// meanwhile, such as `system.ready`, is skipped.
async fn call<R, W>(reader: &mut R, writer: &mut W, req: Envelope) -> Result<Envelope>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send(writer, &req).await?;
    loop {
        let env = read(reader).await?;
        if env.kind == Kind::Response && env.id == req.id {
            if let Some(err) = &env.error {
                warn!(method = ?req.method, code = err.code, message = %err.message, "core rejected request");
            }
            return Ok(env);
        }
        debug!(kind = ?env.kind, method = ?env.method, topic = ?env.topic, "skipped while awaiting response");
    }
}

/// Handshake with the core, register the cleanup timer and handle events
/// until `plugin.stop` or the pipe closes.
pub async fn serve<R, W>(mut reader: R, mut writer: W, state: AppState) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = read(&mut reader).await?;
    if hello.kind != Kind::Event {
        warn!(kind = ?hello.kind, "unexpected first message from core");
    }

    call(
        &mut reader,
        &mut writer,
        Envelope::request("plugin.init", json!({ "metadata": metadata() })),
    )
    .await?;
    call(
        &mut reader,
        &mut writer,
        Envelope::request("plugin.start", json!({})),
    )
    .await?;
    call(
        &mut reader,
        &mut writer,
        Envelope::request("event.subscribe", json!({"topics": ["timer.tick"]})),
    )
    .await?;

    let millis = u64::try_from(state.config.cleanup_interval.as_millis()).unwrap_or(u64::MAX);
    let timer = TimerParams {
        id: CLEANUP_TIMER_ID.into(),
        millis,
    };
    call(
        &mut reader,
        &mut writer,
        Envelope::request("timer.set_interval", serde_json::to_value(&timer)?),
    )
    .await?;
    info!(millis, "cleanup timer registered with core");

    loop {
        let env = match read(&mut reader).await {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "core pipe closed");
                break;
            }
        };
        if env.is_request("plugin.stop") {
            send(&mut writer, &Envelope::response(env.id.clone(), json!({}))).await?;
            break;
        }
        if env.is_event("timer.tick") {
            let tick = env
                .payload
                .and_then(|p| serde_json::from_value::<TimerTick>(p).ok());
            if tick.map(|t| t.id == CLEANUP_TIMER_ID).unwrap_or(false) {
                housekeeping::run_once(state.clone()).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_waits_for_its_own_response() {
        let (core_side, plugin_side) = tokio::io::duplex(64 * 1024);
        let (plugin_r, mut plugin_w) = tokio::io::split(plugin_side);
        let (core_r, mut core_w) = tokio::io::split(core_side);
        let mut plugin_r = BufReader::new(plugin_r);

        let core = tokio::spawn(async move {
            let mut core_r = BufReader::new(core_r);
            let req = read(&mut core_r).await.unwrap();
            send(&mut core_w, &Envelope::event("system.ready", None))
                .await
                .unwrap();
            send(
                &mut core_w,
                &Envelope::response(Some("someone-else".into()), json!({"other": true})),
            )
            .await
            .unwrap();
            send(&mut core_w, &Envelope::response(req.id, json!({"mine": true})))
                .await
                .unwrap();
        });

        let req = Envelope::request("plugin.start", json!({}));
        let resp = call(&mut plugin_r, &mut plugin_w, req.clone()).await.unwrap();
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.result, Some(json!({"mine": true})));
        core.await.unwrap();
    }
}
