use message_broker::setup::{codec_from_settings, connect_transport};
use message_broker::{
    BrokerPublisher, CloudEvent, MessageBrokerSettings, MessagePublisher, OutboxPublisher,
    PgOutboxStore,
};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceCreated {
    invoice_id: String,
    customer_id: String,
    amount: f64,
    currency: String,
}

async fn publish_invoices<P: MessagePublisher>(publisher: &P, count: usize) {
    for n in 1..=count {
        let customer_id = format!("customer-{}", n % 3);
        let event = CloudEvent::create(
            InvoiceCreated {
                invoice_id: format!("inv-{n:04}"),
                customer_id: customer_id.clone(),
                amount: 100.0 + n as f64 * 12.5,
                currency: "EUR".to_string(),
            },
            "invoice.created",
            "urn:billing:producer-demo",
        )
        .with_subject(Some(customer_id.clone()));

        match publisher.publish(&event, Some(&customer_id), None).await {
            Ok(()) => tracing::info!(event_id = %event.id, "Published invoice.created"),
            Err(e) => tracing::error!(event_id = %event.id, error = %e, "Publish failed"),
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

    let count = std::env::var("DEMO_COUNT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(5);

    tracing::info!(
        topic = %settings.topic,
        bus_type = ?settings.bus_type,
        count,
        "Starting producer demo"
    );

    let transport = connect_transport(&settings)
        .await
        .expect("Failed to connect transport");
    let codec = Arc::new(codec_from_settings(&settings).expect("Failed to build codec"));
    let publisher = BrokerPublisher::new(transport, codec, settings.topic.clone());

    match &settings.database {
        Some(db) => {
            let store = PgOutboxStore::connect(db)
                .await
                .expect("Failed to connect to database");
            store.ensure_table().await.expect("Failed to create outbox table");

            tracing::info!("Publishing through the outbox");
            let outbox = OutboxPublisher::new(publisher.clone(), Arc::new(store), settings.topic.clone());
            publish_invoices(&outbox, count).await;
        }
        None => publish_invoices(&publisher, count).await,
    }

    if let Err(e) = publisher.close().await {
        tracing::warn!(error = %e, "Failed to close publisher");
    }
}
