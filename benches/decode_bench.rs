use std::mem::{offset_of, size_of};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use protodyn::base::Message;
use protodyn::containers::RepeatedField;
use protodyn::descriptor::{
    FieldDescriptor, FieldFlags, FieldType, Label, MessageDescriptor, MESSAGE_DESCRIPTOR_MAGIC,
};
use protodyn::wire::write_varint;
use protodyn::{Arena, DecodeContext};

#[repr(C)]
struct Point {
    base: Message,
    x: u64,
    y: u64,
    tags: RepeatedField<i32>,
}

static POINT_FIELDS: [FieldDescriptor; 3] = [
    FieldDescriptor {
        name: "x",
        id: 1,
        label: Label::Optional,
        kind: FieldType::Uint64,
        offset: offset_of!(Point, x),
        quantifier_offset: 0,
        default_value: None,
        reference: None,
        flags: FieldFlags::empty(),
    },
    FieldDescriptor {
        name: "y",
        id: 2,
        label: Label::Optional,
        kind: FieldType::Uint64,
        offset: offset_of!(Point, y),
        quantifier_offset: 0,
        default_value: None,
        reference: None,
        flags: FieldFlags::empty(),
    },
    FieldDescriptor {
        name: "tags",
        id: 3,
        label: Label::Repeated,
        kind: FieldType::Int32,
        offset: offset_of!(Point, tags),
        quantifier_offset: 0,
        default_value: None,
        reference: None,
        flags: FieldFlags::PACKED,
    },
];
static POINT_IDS: [u32; 3] = [1, 2, 3];
static POINT: MessageDescriptor = MessageDescriptor {
    magic: MESSAGE_DESCRIPTOR_MAGIC,
    name: "Point",
    sizeof_message: size_of::<Point>(),
    fields: &POINT_FIELDS,
    field_ids: &POINT_IDS,
    message_init: None,
};

fn make_wire(tags: usize) -> Vec<u8> {
    let mut wire = vec![0x08, 0x96, 0x01, 0x10, 0x2A];
    let mut payload = Vec::new();
    for i in 0..tags {
        write_varint((i * 37 % 1024) as u64, &mut payload);
    }
    wire.push(0x1A);
    write_varint(payload.len() as u64, &mut wire);
    wire.extend_from_slice(&payload);
    wire
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (name, data) in [
        ("small", make_wire(4)),
        ("medium", make_wire(128)),
        ("large", make_wire(4096)),
    ] {
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut arena = Arena::new();
                let msg = DecodeContext::new(black_box(&data), &mut arena)
                    .deserialize(&POINT)
                    .unwrap();
                black_box(msg);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
