//! Decoded heap structures as styled text

use ratatui::prelude::Stylize;
use ratatui::text::{Line, Span};
use segment_heap::segment::RangeKind;
use segment_heap::{
    LfhBucket, LfhContext, LfhSubsegment, PageSegment, SegContext, SegmentHeap, VsChunkFreeHeader,
    VsContext,
};

use crate::ui::{BLUE, GREEN, ORANGE, PURPLE, RED, YELLOW};

fn addr(address: u64) -> Span<'static> {
    format!("0x{address:016x}").fg(ORANGE)
}

fn header(name: &'static str, address: u64) -> Line<'static> {
    Line::from(vec![name.fg(BLUE).bold(), " @ ".into(), addr(address)])
}

fn field(indent: usize, name: &str, value: Span<'static>) -> Line<'static> {
    Line::from(vec![format!("{:indent$}{name:<24}", "").into(), value])
}

fn hex_value(value: u64) -> Span<'static> {
    format!("0x{value:x}").fg(GREEN)
}

pub fn segment_heap(heap: &SegmentHeap) -> Vec<Line<'static>> {
    let mut lines = vec![
        header("_SEGMENT_HEAP", heap.address),
        field(2, "Signature", hex_value(heap.signature)),
        field(2, "GlobalFlags", hex_value(heap.global_flags.into())),
        field(2, "LfhContext", addr(heap.lfh_context)),
        field(2, "VsContext", addr(heap.vs_context)),
    ];
    for (index, context) in heap.seg_contexts.iter().enumerate() {
        match context {
            Some(context) => seg_context(&mut lines, index, context),
            None => lines.push(Line::from(vec![
                format!("  SegContexts[{index}]").fg(BLUE),
                " unreadable".fg(RED),
            ])),
        }
    }
    lines
}

fn seg_context(lines: &mut Vec<Line<'static>>, index: usize, context: &SegContext) {
    lines.push(Line::from(vec![
        format!("  SegContexts[{index}]").fg(BLUE),
        " @ ".into(),
        addr(context.address),
    ]));
    lines.push(field(4, "Heap", addr(context.heap)));
    lines.push(field(4, "SegmentMask", hex_value(context.segment_mask)));
    lines.push(field(4, "UnitShift", hex_value(context.unit_shift.into())));
    lines.push(field(
        4,
        "SegmentCount",
        format!("{} ({} walked)", context.segment_count, context.segments.len()).into(),
    ));
    for segment in &context.segments {
        page_segment(lines, segment);
    }
}

fn page_segment(lines: &mut Vec<Line<'static>>, segment: &PageSegment) {
    lines.push(Line::from(vec![
        "    _HEAP_PAGE_SEGMENT".fg(BLUE),
        " @ ".into(),
        addr(segment.address),
        " Signature ".into(),
        hex_value(segment.signature),
    ]));
    for range in &segment.ranges {
        let kind = match range.kind {
            RangeKind::LfhSubsegment => range.kind.name().fg(GREEN),
            RangeKind::VsSubsegment => range.kind.name().fg(PURPLE),
            RangeKind::LargePoolSubsegment => range.kind.name().fg(YELLOW),
            RangeKind::Unknown(flags) => format!("{} ({flags})", range.kind.name()).fg(RED),
        };
        lines.push(Line::from(vec![
            format!("      [{:3}] ", range.index).into(),
            addr(range.base),
            " - ".into(),
            addr(range.end),
            format!(" {:>8} ", format!("0x{:x}", range.size())).into(),
            kind,
        ]));
    }
}

pub fn lfh_subsegment(subsegment: &LfhSubsegment) -> Vec<Line<'static>> {
    let mut lines = vec![header("_HEAP_LFH_SUBSEGMENT", subsegment.address)];
    subsegment_fields(&mut lines, 2, subsegment);
    lines
}

fn subsegment_fields(lines: &mut Vec<Line<'static>>, indent: usize, subsegment: &LfhSubsegment) {
    lines.push(field(indent, "Location", subsegment.location.name().into()));
    lines.push(field(indent, "FreeCount", subsegment.free_count.to_string().into()));
    lines.push(field(indent, "BlockCount", subsegment.block_count.to_string().into()));
    lines.push(field(indent, "FreeHint", subsegment.free_hint.to_string().into()));
    lines.push(field(indent, "BlockSize", hex_value(subsegment.block_size)));
    lines.push(field(indent, "FirstBlockOffset", hex_value(subsegment.first_block_offset)));
    lines.push(field(
        indent,
        "Blocks",
        format!("{} busy / {}", subsegment.busy_count(), subsegment.blocks.len()).into(),
    ));
    for (index, block) in subsegment.blocks.iter().enumerate() {
        let state = match block.is_busy() {
            Some(true) => block.state().fg(RED),
            Some(false) => block.state().fg(GREEN),
            None => block.state().fg(YELLOW),
        };
        lines.push(Line::from(vec![
            format!("{:indent$}[{index:4}] ", "").into(),
            addr(block.address),
            " ".into(),
            state,
        ]));
    }
}

pub fn lfh_context(context: &LfhContext) -> Vec<Line<'static>> {
    let mut lines = vec![
        header("_HEAP_LFH_CONTEXT", context.address),
        field(2, "BackendCtx", addr(context.backend_ctx)),
        field(2, "MaxAffinity", context.max_affinity.to_string().into()),
        field(2, "MaxBlockSize", hex_value(context.max_block_size.into())),
        field(2, "Randomization", enabled(context.randomization_enabled())),
        field(
            2,
            "WithholdPageCrossing",
            enabled(context.withhold_page_crossing_blocks),
        ),
        field(2, "Buckets", format!("{} active", context.buckets.len()).into()),
    ];
    for bucket in &context.buckets {
        lfh_bucket(&mut lines, bucket);
    }
    lines
}

fn enabled(on: bool) -> Span<'static> {
    if on { "enabled".fg(GREEN) } else { "disabled".fg(RED) }
}

fn lfh_bucket(lines: &mut Vec<Line<'static>>, bucket: &LfhBucket) {
    lines.push(Line::from(vec![
        format!("  Buckets[{}]", bucket.index).fg(BLUE),
        " @ ".into(),
        addr(bucket.address),
    ]));
    lines.push(field(4, "TotalBlockCount", bucket.total_block_count.to_string().into()));
    lines.push(field(4, "TotalSubsegmentCount", bucket.total_subsegment_count.to_string().into()));
    lines.push(field(4, "AffinitySlot", addr(bucket.affinity_slot)));
    lines.push(field(
        4,
        "ActiveSubsegment",
        match bucket.active_subsegment {
            Some(active) => addr(active),
            None => "none".into(),
        },
    ));
    for subsegment in bucket.subsegments() {
        lines.push(Line::from(vec![
            "    _HEAP_LFH_SUBSEGMENT".fg(BLUE),
            " @ ".into(),
            addr(subsegment.address),
        ]));
        subsegment_fields(lines, 6, subsegment);
    }
}

pub fn vs_context(context: &VsContext) -> Vec<Line<'static>> {
    let mut lines = vec![
        header("_HEAP_VS_CONTEXT", context.address),
        field(2, "LockType", context.lock_type.name().into()),
        field(2, "Flags", hex_value(context.flags.into())),
        field(2, "BackendCtx", addr(context.backend_ctx)),
        field(2, "TotalCommittedUnits", hex_value(context.total_committed_units)),
        field(2, "FreeCommittedUnits", hex_value(context.free_committed_units)),
        field(2, "FreeChunkTree", addr(context.tree)),
        field(2, "Root", addr(context.root)),
        field(2, "Encoded", context.encoded.to_string().into()),
        field(2, "FreeChunks", context.free_chunks.len().to_string().into()),
    ];
    for chunk in &context.free_chunks {
        lines.push(free_chunk(chunk));
    }
    lines
}

fn free_chunk(chunk: &VsChunkFreeHeader) -> Line<'static> {
    let allocated = if chunk.is_allocated() { "allocated".fg(RED) } else { "free".fg(GREEN) };
    Line::from(vec![
        "  ".into(),
        addr(chunk.address),
        format!(" size {:>7}", format!("0x{:x}", chunk.size())).into(),
        format!(" prev {:>7} ", format!("0x{:x}", chunk.prev_size())).into(),
        allocated,
        " raw ".into(),
        hex::encode(chunk.raw.to_le_bytes()).fg(PURPLE),
    ])
}

/// Flatten styled lines for a plain terminal
pub fn to_plain(lines: &[Line<'_>]) -> String {
    let mut text = String::new();
    for line in lines {
        for span in &line.spans {
            text.push_str(&span.content);
        }
        text.push('\n');
    }
    text
}
