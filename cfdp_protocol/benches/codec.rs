use cfdp_protocol::{
    Direction, EntityId, FileData, Nak, Pdu, PduPayload, TransactionId, TransmissionMode,
};
use criterion::{criterion_group, criterion_main, Criterion};

fn file_data_pdu(len: usize) -> Pdu {
    Pdu::new(
        TransactionId::new(EntityId(1), 42),
        EntityId(2),
        Direction::TowardReceiver,
        TransmissionMode::Acknowledged,
        PduPayload::FileData(FileData {
            offset: 1 << 20,
            data: vec![0xA5; len],
            segment_metadata: Vec::new(),
        }),
    )
}

// FileData dominates link traffic; measure the hot path at typical segment sizes
fn bench_file_data(c: &mut Criterion) {
    for len in [256usize, 1024, 4096] {
        let pdu = file_data_pdu(len).with_crc(true);
        let bytes = pdu.encode().expect("encode");

        c.bench_function(&format!("file_data_encode_{len}"), |b| {
            b.iter(|| std::hint::black_box(pdu.encode()));
        });
        c.bench_function(&format!("file_data_decode_{len}"), |b| {
            b.iter(|| std::hint::black_box(Pdu::decode(&bytes)));
        });
    }
}

fn bench_nak(c: &mut Criterion) {
    let gaps: Vec<(u64, u64)> = (0..64).map(|i| (i * 1024, i * 1024 + 512)).collect();
    let pdu = Pdu::new(
        TransactionId::new(EntityId(2), 42),
        EntityId(1),
        Direction::TowardSender,
        TransmissionMode::Acknowledged,
        PduPayload::Nak(Nak { start_scope: 0, end_scope: 64 * 1024, gaps }),
    );
    let bytes = pdu.encode().expect("encode");

    c.bench_function("nak_64_gaps_decode", |b| {
        b.iter(|| std::hint::black_box(Pdu::decode(&bytes)));
    });
}

criterion_group!(benches, bench_file_data, bench_nak);
criterion_main!(benches);
