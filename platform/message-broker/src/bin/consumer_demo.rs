use message_broker::setup::{codec_from_settings, connect_transport};
use message_broker::{
    BatchOptions, BrokerConsumer, BrokerPublisher, BrokerResult, BusType, CloudEvent,
    InboxConsumer, MessageBrokerSettings, MessageConsumer, MessagePublisher, PgInboxStore,
    ReceivedMessage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceCreated {
    invoice_id: String,
    customer_id: String,
    amount: f64,
    currency: String,
}

type Invoice = ReceivedMessage<InvoiceCreated>;

async fn handle_invoice(msg: Invoice) -> BrokerResult<()> {
    tracing::info!(
        event_id = %msg.event.id,
        invoice_id = %msg.event.data.invoice_id,
        amount = msg.event.data.amount,
        "Invoice received"
    );
    Ok(())
}

async fn handle_invoices(batch: Vec<Invoice>) -> BrokerResult<()> {
    let total: f64 = batch.iter().map(|m| m.event.data.amount).sum();
    tracing::info!(batch_size = batch.len(), total, "Invoice batch received");
    Ok(())
}

async fn run<C: MessageConsumer>(consumer: C, batch: Option<BatchOptions>, cancel: CancellationToken) -> BrokerResult<()> {
    match batch {
        Some(options) => consumer.consume_batch(options, handle_invoices, cancel).await,
        None => consumer.consume(handle_invoice, cancel).await,
    }
}

/// The in-memory bus is process-local, so seed it with a few events
async fn seed(publisher: &BrokerPublisher) {
    for n in 1..=3 {
        let event = CloudEvent::create(
            InvoiceCreated {
                invoice_id: format!("inv-seed-{n}"),
                customer_id: "customer-0".to_string(),
                amount: 50.0 * n as f64,
                currency: "EUR".to_string(),
            },
            "invoice.created",
            "urn:billing:consumer-demo",
        );
        if let Err(e) = publisher.publish(&event, None, None).await {
            tracing::warn!(error = %e, "Failed to seed demo event");
        }
    }
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings =
        MessageBrokerSettings::from_env().expect("Failed to load configuration from environment");

    let batch = std::env::var("DEMO_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .map(|size| BatchOptions::new(size, Duration::from_secs(5)));

    tracing::info!(
        topic = %settings.topic,
        group_id = %settings.group_id,
        batch = batch.is_some(),
        "Starting consumer demo"
    );

    let transport = connect_transport(&settings)
        .await
        .expect("Failed to connect transport");
    let codec = Arc::new(codec_from_settings(&settings).expect("Failed to build codec"));

    if settings.bus_type == BusType::InMemory {
        seed(&BrokerPublisher::new(transport.clone(), codec.clone(), settings.topic.clone())).await;
    }

    let consumer = BrokerConsumer::new(transport, codec, settings.topic.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            cancel.cancel();
        });
    }

    let result = match &settings.database {
        Some(db) => {
            let store = PgInboxStore::connect(db)
                .await
                .expect("Failed to connect to database");
            store.ensure_table().await.expect("Failed to create inbox table");
            run(InboxConsumer::new(consumer, Arc::new(store)), batch, cancel).await
        }
        None => run(consumer, batch, cancel).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Consumer demo stopped with an error");
        std::process::exit(1);
    }
}
