//! A `HomeView` demo: one module, one mount handler, one state push, driven
//! end to end through an in-process mock core.
//!
//! `cargo run -p app_home` prints the decoded state record that would have
//! landed in a subscribed client.

use std::sync::Arc;

use anyhow::Result;
use anyhow::anyhow;
use rmpv::Value as Wire;
use tracing::error;
use tracing::info;

use hypharpc::codec;
use hypharpc::metadata::MetadataSnapshot;
use hypharpc::metadata::SnapshotBuilder;
use hypharpc::model::Record;
use hypharpc::model::Scalar;
use hypharpc::model::Value;
use hypharun::context::Context;
use hypharun::mock_conduit::MockConduit;
use hypharun::module::Handler;
use hypharun::module::Module;
use hypharun::module::Package;
use hypharun::module::handler;
use hypharun::runtime::RunOptions;
use hypharun::runtime::Runtime;

/// What a core would declare for this deployment: a `HomeView` module whose
/// state touches every field type, an `Author` model it nests, and a `mount`
/// handler taking a title.
fn deployment() -> MetadataSnapshot {
    SnapshotBuilder::new()
        .upstream_id("demo-core")
        .package(0, "")
        .module(0, 1, "HomeView")
        .schema(0, 1)
        .field(0, 1, 1, "title", "s", false)
        .field(0, 1, 2, "visits", "i", false)
        .field(0, 1, 3, "ratio", "f", false)
        .field(0, 1, 4, "live", "b", false)
        .field(0, 1, 5, "icon", "t", false)
        .field(0, 1, 6, "tags", "s", true)
        .field(0, 1, 7, "author", "HomeView.Author", false)
        .field(0, 1, 8, "editors", "HomeView.Author", true)
        .state_model(0, 1, 1, 1)
        .schema(0, 2)
        .field(0, 2, 1, "name", "s", false)
        .field(0, 2, 2, "admin", "b", false)
        .model(0, 1, 2, "Author", 2)
        .schema(0, 3)
        .field(0, 3, 1, "title", "s", false)
        .handler(0, 1, 1, "mount", 3)
        .build()
}

struct HomeView;

impl Module for HomeView {
    fn name(&self) -> &str {
        "HomeView"
    }

    fn handlers(&self) -> Vec<(&'static str, Handler)> {
        vec![("mount", handler(mount))]
    }
}

async fn mount(ctx: Arc<Context>) {
    if let Err(error) = render_home(&ctx).await {
        error!(%error, "mount failed");
    }
}

async fn render_home(ctx: &Context) -> Result<()> {
    let title = ctx
        .data
        .get("title")
        .and_then(Value::as_one)
        .and_then(Scalar::as_str)
        .unwrap_or("home")
        .to_string();
    ctx.set_cookie("last_title", &title, 3600, false)?;

    let mut author = ctx
        .model("HomeView.Author")
        .ok_or_else(|| anyhow!("author model missing"))?;
    author.set("name", "ada")?;
    author.set("admin", true)?;

    let mut editor = ctx
        .model("HomeView.Author")
        .ok_or_else(|| anyhow!("author model missing"))?;
    editor.set("name", "grace")?;

    let mut state = ctx
        .model("HomeView.State")
        .ok_or_else(|| anyhow!("state model missing"))?;
    state.set("title", title)?;
    state.set("visits", 1)?;
    state.set("ratio", 0.5)?;
    state.set("live", true)?;
    state.set("icon", vec![0x68u8, 0x79])?;
    state.set("tags", Value::many(["rust", "demo"]))?;
    state.set("author", author)?;
    state.set("editors", Value::many([editor]))?;
    ctx.render(&state).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let snapshot = deployment();
    let (conduit, handle) = MockConduit::new(&snapshot);
    let package = Package::main().module(HomeView);
    let runtime = Runtime::start(vec![package], RunOptions::new().dev(true), conduit.clone())?;

    // What a browser session would trigger: one mount carrying a title.
    let body = codec::encode_multi(&[Wire::from(1u32), Wire::from("hypha demo")])?;
    handle.push_invoke(0, "sock-demo", 1, 1, Some(body));
    handle.close();
    runtime.run().await?;

    for sent in conduit.sent() {
        show(&runtime, &sent.socket_id, &sent.frame)?;
    }
    Ok(())
}

/// Decodes one outbound frame and logs what it carried.
fn show(runtime: &Runtime, socket_id: &str, frame: &[u8]) -> Result<()> {
    let items = codec::decode_multi(frame)?;
    let [_kind, _package, _headers, payload]: [Wire; 4] = items
        .try_into()
        .map_err(|_| anyhow!("outbound frame is not a four-item envelope"))?;
    let Wire::Binary(payload) = payload else {
        return Err(anyhow!("outbound payload is not binary"));
    };
    let inner = codec::decode_multi(&payload)?;
    match inner.first().and_then(Wire::as_u64) {
        Some(2) => {
            let Some(Wire::Binary(record_bytes)) = inner.get(3) else {
                return Err(anyhow!("state push carries no record"));
            };
            let mut state = Record::named(runtime.schemas(), "HomeView.State")
                .ok_or_else(|| anyhow!("state schema missing"))?;
            state.decode(record_bytes)?;
            info!(socket = socket_id, state = %state.to_object(), "state push");
        }
        Some(3) => {
            info!(socket = socket_id, "set-cookie: {:?}", &inner[1..]);
        }
        other => info!(socket = socket_id, ?other, "other outbound message"),
    }
    Ok(())
}
