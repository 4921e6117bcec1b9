use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use apache_avro::Schema;
use message_broker::avro::{decode_datum, encode_datum};
use message_broker::{CloudEvent, Codec, InMemorySchemaRegistry, InlineSchemaResolver, Payload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const INVOICE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "InvoiceCreated",
    "fields": [
        {"name": "invoiceId", "type": "string"},
        {"name": "amount", "type": "double"},
        {"name": "lines", "type": {"type": "array", "items": {
            "type": "record",
            "name": "Line",
            "fields": [
                {"name": "sku", "type": "string"},
                {"name": "quantity", "type": "long"}
            ]
        }}}
    ]
}"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Line {
    sku: String,
    quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceCreated {
    invoice_id: String,
    amount: f64,
    lines: Vec<Line>,
}

fn invoice(lines: usize) -> CloudEvent<InvoiceCreated> {
    CloudEvent::create(
        InvoiceCreated {
            invoice_id: "inv-0001".to_string(),
            amount: 150.75,
            lines: (0..lines)
                .map(|n| Line {
                    sku: format!("SKU-{n}"),
                    quantity: n as i64 + 1,
                })
                .collect(),
        },
        "invoice.created",
        "urn:billing",
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("failed to build runtime")
}

fn bench_datum(c: &mut Criterion) {
    let schema = Schema::parse_str(INVOICE_SCHEMA).expect("valid schema");
    let mut group = c.benchmark_group("avro_datum");

    for lines in [1usize, 10, 100] {
        let payload = Payload::from_serialize(&invoice(lines).data).expect("serializable");
        let datum = encode_datum(&schema, &payload).expect("encodable");
        group.throughput(Throughput::Bytes(datum.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", lines), &payload, |b, payload| {
            b.iter(|| encode_datum(black_box(&schema), black_box(payload)))
        });
        group.bench_with_input(BenchmarkId::new("decode", lines), &datum, |b, datum| {
            b.iter(|| decode_datum(black_box(&schema), black_box(datum)))
        });
    }
    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let rt = runtime();
    let text = Codec::json();
    let binary = rt.block_on(async {
        let registry = Arc::new(InMemorySchemaRegistry::new());
        registry
            .register("billing.invoice.created", INVOICE_SCHEMA)
            .await
            .expect("registered");
        let resolver =
            InlineSchemaResolver::new("billing").with_schema("invoice.created", INVOICE_SCHEMA);
        Codec::avro(Arc::new(resolver), registry)
    });

    let event = invoice(10);
    let mut group = c.benchmark_group("envelope");

    for (name, codec) in [("text", &text), ("binary", &binary)] {
        let bytes = rt.block_on(codec.encode(&event)).expect("encodable");
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_function(BenchmarkId::new("encode", name), |b| {
            b.iter(|| rt.block_on(codec.encode(black_box(&event))))
        });
        group.bench_function(BenchmarkId::new("decode", name), |b| {
            b.iter(|| rt.block_on(codec.decode::<InvoiceCreated>(black_box(&bytes))))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_datum, bench_envelope);
criterion_main!(benches);
