use std::{sync::Arc, time::Duration};

use futures_util::stream;
use rpchan::{
    stream_protocol::{StreamProtocol, StreamPublisher},
    transports::memory::MemoryTransport,
    Context, JsonCodec, Listener,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct T {
    a: i32,
    b: i32,
    c: String,
}

/// Publishes one value per second until the consumer closes the stream
async fn run_server(transport: Arc<MemoryTransport>) {
    let publisher = StreamPublisher::new(transport, 1, 1);
    let ticks = stream::unfold(0, |a| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let value = T {
            a,
            b: a * a,
            c: format!("tick #{a}"),
        };
        let payload = serde_json::to_vec(&value).unwrap_or_default();
        Some((payload, a + 1))
    });

    match publisher.publish(ticks).await {
        Ok(outcome) => println!("> Server > stream finished: {outcome:?}"),
        Err(error) => println!("> Server > stream failed: {error}"),
    }
}

#[tokio::main]
async fn main() {
    println!("--- Listening to a server stream for 10 seconds ---");
    let (client_transport, server_transport) = MemoryTransport::create();
    let server_handle = tokio::spawn(run_server(Arc::new(server_transport)));

    let (ctx, _) = Context::background().with_timeout(Duration::from_secs(10));
    // kept alive until the server read the close notification
    let client_transport = Arc::new(client_transport);
    let source = StreamProtocol::new(client_transport.clone(), 1, 1);
    let mut values = Listener::new(source, JsonCodec).listen::<T>(&ctx, 1);

    while let Some(v) = values.next().await {
        println!("{v:?}");
    }

    println!(
        "> Client > stream ended: {:?} (context: {:?})",
        values.closed().await,
        ctx.err()
    );
    if server_handle.await.is_err() {
        log::error!("server task panicked");
    }
}
