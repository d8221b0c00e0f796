#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::needless_pass_by_value)]

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use clap_cargo::style::CLAP_STYLING;
use deku::ctx::Endian;
use env_logger::{Builder, Env};
use log::{debug, error, info};
use ratatui::DefaultTerminal;
use ratatui::crossterm::event::{self, Event, KeyCode, KeyEventKind};
use ratatui::prelude::*;
use ratatui::widgets::ScrollbarState;
use segment_heap::{Layout, Snapshot, Target};
use tui_input::Input;
use tui_input::backend::crossterm::EventHandler;

use command::{Command, HELP};
use ui::{BLUE, GRAY_FG, RED};

mod command;
mod render;
mod ui;

#[derive(Debug, Copy, Clone)]
enum InputMode {
    Normal,
    Editing,
}

#[derive(Debug, Clone)]
struct LimitedBuffer<T> {
    offset: usize,
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> LimitedBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self { offset: 0, buffer: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, value: T) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(value);
    }
}

/// Raw memory dump mapped at `ADDR`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Region {
    address: u64,
    path: PathBuf,
}

fn parse_region(s: &str) -> Result<Region, String> {
    let (address, path) = s.split_once('=').ok_or("expected ADDR=PATH")?;
    let address = command::parse_address(address).map_err(|e| e.to_string())?;
    Ok(Region { address, path: PathBuf::from(path) })
}

/// Resolved `MODULE!SYMBOL=ADDR`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Global {
    module: String,
    symbol: String,
    address: u64,
}

fn parse_global(s: &str) -> Result<Global, String> {
    let (name, address) = s.split_once('=').ok_or("expected MODULE!SYMBOL=ADDR")?;
    let (module, symbol) = name.split_once('!').ok_or("expected MODULE!SYMBOL")?;
    let address = command::parse_address(address).map_err(|e| e.to_string())?;
    Ok(Global { module: module.to_owned(), symbol: symbol.to_owned(), address })
}

#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None, styles = CLAP_STYLING)]
struct Args {
    /// Map a raw memory dump at an address, `ADDR=PATH`
    ///
    /// Can be given multiple times, regions must not overlap
    #[arg(long = "region", value_parser = parse_region)]
    regions: Vec<Region>,

    /// Resolve a global, `MODULE!SYMBOL=ADDR`
    ///
    /// `nt!RtlpHpHeapGlobals` is needed for every command except `segheap`
    #[arg(long = "global", value_parser = parse_global)]
    globals: Vec<Global>,

    /// Structure offsets overriding the built-in x64 layout
    ///
    /// One `STRUCT.FIELD OFFSET [WIDTH] [bit POS LEN]` per line
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Pointer width of the target
    #[arg(long)]
    #[arg(value_enum)]
    #[arg(default_value_t = PtrSize::default())]
    ptr_size: PtrSize,

    /// Snapshot was taken from a user mode session
    #[arg(long)]
    user_mode: bool,

    /// Read memory as big endian
    #[arg(long)]
    big_endian: bool,

    /// Execute commands line-by-line from file
    ///
    /// lines starting with # are ignored
    #[arg(short, long)]
    cmds: Option<PathBuf>,

    /// Print results to stdout instead of starting the TUI
    ///
    /// Commands come from `--cmds`, or stdin when not given
    #[arg(long)]
    batch: bool,

    /// Path to write log
    ///
    /// Set env `RUST_LOG` to change log level
    #[arg(long)]
    log_path: Option<String>,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum PtrSize {
    #[value(name = "32")]
    Size32,
    #[default]
    #[value(name = "64")]
    Size64,
}

impl PtrSize {
    fn bytes(self) -> u8 {
        match self {
            PtrSize::Size32 => 4,
            PtrSize::Size64 => 8,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Scroll {
    scroll: usize,
    state: ScrollbarState,
}

impl Scroll {
    pub fn reset(&mut self) {
        self.scroll = 0;
        self.state = self.state.position(0);
    }

    pub fn end(&mut self, len: usize) {
        self.scroll = len;
        self.state.last();
    }

    pub fn down(&mut self, n: usize, len: usize) {
        if self.scroll < len.saturating_sub(1) {
            self.scroll += n;
            self.state = self.state.position(self.scroll);
        }
    }

    pub fn up(&mut self, n: usize) {
        if self.scroll > n {
            self.scroll -= n;
        } else {
            self.scroll = 0;
        }
        self.state = self.state.position(self.scroll);
    }

    pub fn jump(&mut self, line: usize) {
        self.scroll = line;
        self.state = self.state.position(line);
    }
}

/// Memory and structure layout every command runs against
struct Session {
    snapshot: Snapshot,
    layout: Layout,
}

impl Session {
    fn new(args: &Args) -> anyhow::Result<Self> {
        Ok(Self { snapshot: load_snapshot(args)?, layout: load_layout(args.layout.as_deref())? })
    }

    /// `64-bit kernel, 3 regions`
    fn describe(&self) -> String {
        let target = &self.snapshot;
        format!(
            "{}-bit {}, {} regions",
            u32::from(target.pointer_size()) * 8,
            if target.is_kernel() { "kernel" } else { "user" },
            target.regions().count()
        )
    }

    fn execute(&self, command: Command) -> anyhow::Result<Vec<Line<'static>>> {
        let target: &dyn Target = &self.snapshot;
        let layout = &self.layout;
        let lines = match command {
            Command::SegHeap(address) => {
                render::segment_heap(&segment_heap::segheap(target, layout, address)?)
            }
            Command::LfhSub(address) => {
                render::lfh_subsegment(&segment_heap::lfhsub(target, layout, address)?)
            }
            Command::LfhCtx(address) => {
                render::lfh_context(&segment_heap::lfhctx(target, layout, address)?)
            }
            Command::VsCtx(address) => {
                render::vs_context(&segment_heap::vsctx(target, layout, address)?)
            }
            Command::Help => HELP
                .iter()
                .map(|(usage, about)| {
                    Line::from(vec![format!("  {usage:<16}").fg(BLUE), (*about).into()])
                })
                .collect(),
            Command::Clear => vec![],
        };
        Ok(lines)
    }
}

fn load_snapshot(args: &Args) -> anyhow::Result<Snapshot> {
    let endian = if args.big_endian { Endian::Big } else { Endian::Little };
    let mut snapshot = Snapshot::new()
        .with_endian(endian)
        .with_pointer_size(args.ptr_size.bytes())
        .with_kernel(!args.user_mode);

    for region in &args.regions {
        snapshot.load_region(region.address, &region.path).with_context(|| {
            format!("Could not map {} at 0x{:x}", region.path.display(), region.address)
        })?;
        debug!("mapped {} at 0x{:x}", region.path.display(), region.address);
    }
    for global in &args.globals {
        snapshot.add_global(&global.module, &global.symbol, global.address);
    }
    Ok(snapshot)
}

fn load_layout(path: Option<&Path>) -> anyhow::Result<Layout> {
    let mut layout = Layout::nt_x64().clone();
    if let Some(path) = path {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read layout {}", path.display()))?;
        layout.merge(&Layout::parse(&text)?);
        info!("layout overrides from {}", path.display());
    }
    Ok(layout)
}

#[derive(Debug, Clone)]
struct State {
    /// Current value of the input box
    input: Input,
    /// Current input mode
    input_mode: InputMode,
    /// History of recorded messages
    sent_input: LimitedBuffer<String>,
    output: Vec<Line<'static>>,
    output_scroll: Scroll,
    /// Key help shown on the input box
    status: String,
    /// Snapshot summary shown on the input box
    target: String,
}

impl State {
    fn new(session: &Session) -> Self {
        Self {
            input: Input::default(),
            input_mode: InputMode::Normal,
            sent_input: LimitedBuffer::new(100),
            output: Vec::new(),
            output_scroll: Scroll::default(),
            status: String::new(),
            target: session.describe(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_path.as_ref(), args.batch)?;

    if let Some(cmds) = &args.cmds
        && !cmds.exists()
    {
        bail!("cmds file {} doesn't exist", cmds.display());
    }

    let session = Session::new(&args)?;
    let mut state = State::new(&session);
    info!("{}", state.target);

    let cmds: Vec<String> = match &args.cmds {
        Some(cmds) => fs::read_to_string(cmds)?.lines().map(str::to_owned).collect(),
        None => vec![],
    };

    if args.batch {
        let mut stdout = io::stdout().lock();
        if args.cmds.is_some() {
            run_batch(&session, &mut state, cmds, &mut stdout)?;
        } else {
            let lines = io::stdin().lock().lines().collect::<io::Result<Vec<_>>>()?;
            run_batch(&session, &mut state, lines, &mut stdout)?;
        }
        return Ok(());
    }

    for cmd in &cmds {
        if !cmd.starts_with('#') {
            state.sent_input.push(cmd.clone());
            process_line(&session, &mut state, cmd);
        }
    }

    let mut terminal = ratatui::init();
    let res = run_app(&mut terminal, &session, &mut state);
    ratatui::restore();

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

/// With `--log-path` everything goes to the file. Batch runs without one log to stderr.
fn init_logging(log_path: Option<&String>, stderr: bool) -> anyhow::Result<()> {
    if let Some(log_path) = log_path {
        let log_file =
            Arc::new(Mutex::new(File::create(log_path).context("Could not create log file")?));
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(move |buf, record| {
                let mut log_file =
                    log_file.lock().map_err(|_| io::Error::other("log file lock poisoned"))?;
                let log_msg = format!(
                    "{} [{}] - {}\n",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                );
                log_file.write_all(log_msg.as_bytes())?;
                writeln!(buf, "{}", log_msg.trim_end())
            })
            .target(env_logger::Target::Pipe(Box::new(std::io::sink()))) // Disable stdout/stderr
            .init();
    } else if stderr {
        Builder::from_env(Env::default().default_filter_or("info"))
            .target(env_logger::Target::Stderr)
            .init();
    }
    Ok(())
}

/// Run every line and write the plain output of each
fn run_batch(
    session: &Session,
    state: &mut State,
    lines: impl IntoIterator<Item = String>,
    out: &mut impl Write,
) -> io::Result<()> {
    for line in lines {
        state.output.clear();
        process_line(session, state, &line);
        out.write_all(render::to_plain(&state.output).as_bytes())?;
    }
    out.flush()
}

fn run_app(terminal: &mut DefaultTerminal, session: &Session, state: &mut State) -> io::Result<()> {
    loop {
        terminal.draw(|f| ui::ui(f, state))?;

        if !event::poll(Duration::from_millis(250))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let len = state.output.len();
        match (state.input_mode, key.code) {
            (InputMode::Normal, KeyCode::Char('i')) => {
                state.input_mode = InputMode::Editing;
            }
            (InputMode::Normal, KeyCode::Char('q')) => {
                return Ok(());
            }
            (InputMode::Normal, KeyCode::Char('j')) => state.output_scroll.down(1, len),
            (InputMode::Normal, KeyCode::Char('J')) => state.output_scroll.down(50, len),
            (InputMode::Normal, KeyCode::Char('k')) => state.output_scroll.up(1),
            (InputMode::Normal, KeyCode::Char('K')) => state.output_scroll.up(50),
            (InputMode::Normal, KeyCode::Char('g')) => state.output_scroll.reset(),
            (InputMode::Normal, KeyCode::Char('G')) => state.output_scroll.end(len),
            (InputMode::Editing, KeyCode::Esc) => {
                state.input_mode = InputMode::Normal;
            }
            (_, KeyCode::Enter) => key_enter(session, state),
            (_, KeyCode::Down) => key_down(state),
            (_, KeyCode::Up) => key_up(state),
            (InputMode::Editing, _) => {
                state.input.handle_event(&Event::Key(key));
            }
            _ => (),
        }
    }
}

fn key_up(state: &mut State) {
    if state.sent_input.buffer.is_empty() {
        state.sent_input.offset = 0;
    } else {
        if state.sent_input.offset < state.sent_input.buffer.len() {
            state.sent_input.offset += 1;
        }
        update_from_previous_input(state);
    }
}

fn key_down(state: &mut State) {
    if state.sent_input.buffer.is_empty() {
        state.sent_input.offset = 0;
    } else {
        if state.sent_input.offset != 0 {
            state.sent_input.offset -= 1;
            if state.sent_input.offset == 0 {
                state.input.reset();
            }
        }
        update_from_previous_input(state);
    }
}

/// Empty input repeats the last command
fn key_enter(session: &Session, state: &mut State) {
    state.sent_input.offset = 0;
    if state.input.value().is_empty() {
        if let Some(val) = state.sent_input.buffer.back().cloned() {
            process_line(session, state, &val);
        }
    } else {
        let val = state.input.value().to_owned();
        state.sent_input.push(val.clone());
        process_line(session, state, &val);
    }
}

fn error_line(err: impl std::fmt::Display) -> Line<'static> {
    Line::from(format!("error: {err:#}").fg(RED))
}

/// Echo `val`, run it, and scroll to its output
fn process_line(session: &Session, state: &mut State, val: &str) {
    let val = val.trim();
    if val.is_empty() || val.starts_with('#') {
        return;
    }
    state.input.reset();

    let start = state.output.len();
    state.output.push(Line::from(vec!["> ".fg(GRAY_FG), val.to_owned().bold()]));

    match Command::parse(val) {
        Ok(Command::Clear) => {
            state.output.clear();
            state.output_scroll.reset();
            return;
        }
        Ok(command) => match session.execute(command) {
            Ok(lines) => state.output.extend(lines),
            Err(err) => {
                error!("{val}: {err:#}");
                state.output.push(error_line(err));
            }
        },
        Err(err) => state.output.push(error_line(err)),
    }

    state.output_scroll.jump(start);
}

fn update_from_previous_input(state: &mut State) {
    if state.sent_input.buffer.len() >= state.sent_input.offset
        && let Some(msg) =
            state.sent_input.buffer.get(state.sent_input.buffer.len() - state.sent_input.offset)
    {
        state.input = Input::new(msg.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;
    use ratatui::{Terminal, backend::TestBackend};
    use rstest::rstest;

    const GLOBALS: u64 = 0xfffff802_1c400000;
    const HEAP: u64 = 0xffffa000_00000000;
    // low 32 bits clear so the lfh salt is only the key
    const SUBSEGMENT: u64 = 0xffffb680_00000000;

    fn session() -> Session {
        let mut snapshot = Snapshot::new();
        snapshot.add_zeroed(GLOBALS, 0x100).unwrap();
        snapshot.add_global("nt", "RtlpHpHeapGlobals", GLOBALS);
        snapshot.add_zeroed(HEAP, 0x1000).unwrap();
        snapshot.add_zeroed(SUBSEGMENT, 0x1000).unwrap();
        snapshot.write_u16(SUBSEGMENT + 0x22, 2).unwrap();
        snapshot.write_u16(SUBSEGMENT + 0x28, 0x30).unwrap();
        snapshot.write_u16(SUBSEGMENT + 0x2a, 0x40).unwrap();
        Session { snapshot, layout: Layout::nt_x64().clone() }
    }

    fn plain(state: &State) -> String {
        render::to_plain(&state.output)
    }

    #[test]
    fn test_limited_buffer() {
        let mut buffer = LimitedBuffer::new(2);
        buffer.push(1);
        buffer.push(2);
        buffer.push(3);
        assert_eq!(buffer.buffer, VecDeque::from(vec![2, 3]));
        assert_eq!(buffer.buffer.back(), Some(&3));
    }

    #[test]
    fn test_repeat_after_history_wraps() {
        let session = session();
        let mut state = State::new(&session);
        state.sent_input = LimitedBuffer::new(2);
        for line in ["help", "help", "clear"] {
            state.input = Input::new(line.to_owned());
            key_enter(&session, &mut state);
        }
        process_line(&session, &mut state, "help");
        assert!(!state.output.is_empty());

        // empty input repeats `clear`, the newest entry
        key_enter(&session, &mut state);
        assert!(state.output.is_empty());
    }

    #[test]
    fn test_scroll() {
        let mut scroll = Scroll::default();
        scroll.down(1, 10);
        scroll.down(50, 10);
        assert_eq!(scroll.scroll, 51);
        // past the end, no more movement
        scroll.down(1, 10);
        assert_eq!(scroll.scroll, 51);
        scroll.up(50);
        assert_eq!(scroll.scroll, 1);
        scroll.up(50);
        assert_eq!(scroll.scroll, 0);
        scroll.jump(7);
        assert_eq!(scroll.scroll, 7);
        scroll.reset();
        assert_eq!(scroll.scroll, 0);
    }

    #[rstest]
    #[case("0xffffa000=heap.bin", 0xffffa000, "heap.bin")]
    #[case("ffffa000`00000000=/tmp/a=b", 0xffffa00000000000, "/tmp/a=b")]
    fn test_parse_region(#[case] s: &str, #[case] address: u64, #[case] path: &str) {
        assert_eq!(parse_region(s).unwrap(), Region { address, path: PathBuf::from(path) });
    }

    #[rstest]
    #[case("heap.bin")]
    #[case("zz=heap.bin")]
    fn test_parse_region_invalid(#[case] s: &str) {
        assert!(parse_region(s).is_err());
    }

    #[test]
    fn test_parse_global() {
        let global = parse_global("nt!RtlpHpHeapGlobals=0xfffff8021c400000").unwrap();
        assert_eq!(global.module, "nt");
        assert_eq!(global.symbol, "RtlpHpHeapGlobals");
        assert_eq!(global.address, 0xfffff8021c400000);

        assert!(parse_global("RtlpHpHeapGlobals=0x1000").is_err());
        assert!(parse_global("nt!RtlpHpHeapGlobals").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "segheap",
            "--region",
            "0x1000=a.bin",
            "--region",
            "0x2000=b.bin",
            "--global",
            "nt!RtlpHpHeapGlobals=0x3000",
            "--ptr-size",
            "32",
            "--batch",
        ])
        .unwrap();
        assert_eq!(args.regions.len(), 2);
        assert_eq!(args.globals[0].address, 0x3000);
        assert_eq!(args.ptr_size, PtrSize::Size32);
        assert!(args.batch);
        assert!(!args.user_mode);
    }

    #[test]
    fn test_load_layout_override() {
        let path = std::env::temp_dir().join("segheap-test-layout.txt");
        fs::write(&path, "_HEAP_LFH_SUBSEGMENT.BlockCount 0x24 2\n").unwrap();
        let layout = load_layout(Some(&path)).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(layout.offset_of("_HEAP_LFH_SUBSEGMENT", "BlockCount").unwrap(), 0x24);
        assert_eq!(layout.offset_of("_HEAP_LFH_SUBSEGMENT", "FreeCount").unwrap(), 0x20);
    }

    #[test]
    fn test_load_snapshot_missing_region() {
        let args = Args {
            regions: vec![Region { address: 0x1000, path: PathBuf::from("/nonexistent/heap.bin") }],
            ..Args::default()
        };
        assert!(load_snapshot(&args).is_err());
    }

    #[test]
    fn test_process_lfhsub() {
        let session = session();
        let mut state = State::new(&session);
        process_line(&session, &mut state, "lfhsub 0xffffb68000000000");

        let output = plain(&state);
        assert!(output.starts_with("> lfhsub 0xffffb68000000000\n"));
        assert!(output.contains("_HEAP_LFH_SUBSEGMENT @ 0xffffb68000000000"));
        assert!(output.contains("Blocks                  0 busy / 2"));
        assert!(output.contains("[   1] 0xffffb68000000070 Free"));
    }

    #[test]
    fn test_process_error_keeps_going() {
        let session = session();
        let mut state = State::new(&session);
        process_line(&session, &mut state, "segheap 0xffffa00000000000");
        process_line(&session, &mut state, "frobnicate");
        process_line(&session, &mut state, "# comment");
        process_line(&session, &mut state, "help");

        let output = plain(&state);
        assert!(output.contains("error: invalid _SEGMENT_HEAP.Signature"), "{output}");
        assert!(output.contains("error: unknown command `frobnicate`"));
        assert!(!output.contains("comment"));
        assert!(output.contains("vsctx <addr>"));
    }

    #[test]
    fn test_clear() {
        let session = session();
        let mut state = State::new(&session);
        process_line(&session, &mut state, "help");
        assert!(!state.output.is_empty());
        process_line(&session, &mut state, "clear");
        assert!(state.output.is_empty());
        assert_eq!(state.output_scroll.scroll, 0);
    }

    #[test]
    fn test_scroll_follows_new_output() {
        let session = session();
        let mut state = State::new(&session);
        process_line(&session, &mut state, "help");
        let start = state.output.len();
        process_line(&session, &mut state, "help");
        assert_eq!(state.output_scroll.scroll, start);
    }

    #[test]
    fn test_history() {
        let session = session();
        let mut state = State::new(&session);
        state.input = Input::new("help".to_owned());
        key_enter(&session, &mut state);
        state.input = Input::new("clear".to_owned());
        key_enter(&session, &mut state);

        key_up(&mut state);
        assert_eq!(state.input.value(), "clear");
        key_up(&mut state);
        assert_eq!(state.input.value(), "help");
        key_down(&mut state);
        assert_eq!(state.input.value(), "clear");
        key_down(&mut state);
        assert_eq!(state.input.value(), "");

        // empty input repeats the last command
        key_enter(&session, &mut state);
        assert!(state.output.is_empty());
    }

    #[test]
    fn test_batch() {
        let session = session();
        let mut state = State::new(&session);
        let mut out = Vec::new();
        let lines = ["# lfh".to_owned(), "lfhsub (0xffffb68000000000 + 0x0)".to_owned()];
        run_batch(&session, &mut state, lines, &mut out).unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("_HEAP_LFH_SUBSEGMENT @ 0xffffb68000000000"));
        assert!(!out.contains("# lfh"));
    }

    #[test]
    fn test_unsupported_target() {
        let mut session = session();
        session.snapshot = session.snapshot.clone().with_kernel(false);
        let mut state = State::new(&session);
        process_line(&session, &mut state, "vsctx 0xffffa00000000000");
        assert!(plain(&state).contains("error: unsupported target"), "{}", plain(&state));
    }

    #[test]
    fn test_ui_render() {
        let session = session();
        let mut state = State::new(&session);
        process_line(&session, &mut state, "help");

        let mut terminal = Terminal::new(TestBackend::new(100, 20)).unwrap();
        terminal.draw(|f| ui::ui(f, &mut state)).unwrap();
        let buffer = terminal.backend().buffer();
        let text: String = buffer
            .content()
            .chunks(buffer.area.width as usize)
            .map(|row| row.iter().map(|cell| cell.symbol()).collect::<String>() + "\n")
            .collect();

        assert!(text.contains(env!("CARGO_PKG_NAME")));
        assert!(text.contains("> help"));
        assert!(text.contains("64-bit kernel, 3 regions"));
        assert_snapshot!(state.status, @"Press q to exit, i to enter input");
    }
}
