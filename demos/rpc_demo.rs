use anyhow::Result;
use rabbitbus::{BusConfig, MessageBus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct CalculationRequest {
    operation: String,
    values: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalculationResponse {
    result: f64,
}

async fn run_server() -> Result<()> {
    let bus = MessageBus::from_config(BusConfig::from_env()?);
    let channel = bus.channel().await?;

    channel
        .rpc()
        .accept("calculations", |request: CalculationRequest| async move {
            let result: f64 = match request.operation.as_str() {
                "multiply" => request.values.iter().product(),
                _ => request.values.iter().sum(),
            };
            Ok(CalculationResponse { result })
        })
        .await?;

    println!("RPC server started. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn run_client() -> Result<()> {
    let bus = MessageBus::from_config(BusConfig::from_env()?);
    let channel = bus.channel().await?;

    let request = CalculationRequest {
        operation: "add".to_string(),
        values: vec![1.5, 2.5, 3.5],
    };
    let response: CalculationResponse = channel.rpc().request("calculations", &request).await?;
    println!("add {:?} = {}", request.values, response.result);

    let request = CalculationRequest {
        operation: "multiply".to_string(),
        values: vec![2.0, 3.0, 4.0],
    };
    let response: CalculationResponse = channel.rpc().request("calculations", &request).await?;
    println!("multiply {:?} = {}", request.values, response.result);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("server") => run_server().await,
        Some("client") => run_client().await,
        _ => {
            println!("Usage: cargo run --example rpc_demo [server|client]");
            Ok(())
        }
    }
}
