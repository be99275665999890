use futures_util::StreamExt;
use portcullis::{Dispatch, GatewayClient, IdentifyOptions};

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let token = std::env::var("GATEWAY_TOKEN")
        .map_err(|_| {
            println!("No GATEWAY_TOKEN env var or invalid");
            std::process::exit(1);
        })
        .unwrap();

    let client = GatewayClient::new(IdentifyOptions::new(&token));
    let mut events = client.dispatch();

    tokio::select! {
        result = client.run("wss://gateway.discord.gg") => {
            result.unwrap();
        }
        () = async {
            while let Some(event) = events.next().await {
                match event {
                    Dispatch::Event { name, .. } => println!("event: {name}"),
                    other => println!("{other:?}"),
                }
            }
        } => {}
    }
}
