use std::error::Error;

use serde_json::json;
use tracing_subscriber::EnvFilter;
use yallma3_client::channel::{ChannelClient, ClientEvent, Topic};
use yallma3_client::config::{load_api_config, ClientOptions};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let workspace_id = "REPLACE_WITH_WORKSPACE_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let options = ClientOptions::from_api_config(&load_api_config()).with_verbose(true);
        let client = ChannelClient::new(options);

        let mut console = client.subscribe(Topic::Console)?;
        let mut results = client.subscribe(Topic::WorkflowResult)?;
        let mut requests = client.subscribe(Topic::RunWorkflow)?;

        client.connect().await?;
        client.run_workspace(&workspace_id, Some(&json!({"input": "hello"})))?;

        loop {
            tokio::select! {
                Some(ClientEvent::Console(data)) = console.recv() => {
                    println!("console: {data}");
                }
                Some(ClientEvent::RunWorkflow(request)) = requests.recv() => {
                    let request_id = request.request_id.unwrap_or_default();
                    client.send_error_reply(
                        &request_id,
                        json!({"error": "demo does not serve workflow files"}),
                    )?;
                }
                Some(ClientEvent::WorkflowResult(envelope)) = results.recv() => {
                    println!("result: {}", envelope.data.unwrap_or_default());
                    break;
                }
                else => break,
            }
        }

        client.disconnect().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
