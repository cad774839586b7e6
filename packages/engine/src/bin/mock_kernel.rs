// packages/engine/src/bin/mock_kernel.rs
//! Stand-in kernel speaking the engine's stdio protocol
//!
//! Announces readiness, then answers each request frame in order with a
//! response envelope. It understands a small set of functions, enough to
//! exercise sessions and pools without a real kernel installed:
//!
//! | Input                     | Result                                   |
//! |---------------------------|------------------------------------------|
//! | `Range[n]`, `Range[a, b]` | `{1, ..., n}`, `{a, ..., b}`             |
//! | `Plus[a, b, ...]`         | integer or real sum                      |
//! | `Pause[s]`                | sleeps `s` seconds, `Null`               |
//! | `a; b; c`                 | evaluates in order, last value           |
//! | `FromLetterNumber[i]`     | `"a"` .. `"z"`                           |
//! | `Message["tag", "text"]`  | records a message, marks failure, `Null` |
//! | `$ProcessID`              | process id                               |
//! | `Kill[]`                  | exits immediately with status 1          |
//! | `Garbage[]`               | writes bytes that are not a message      |
//! | `BadResult[]`             | envelope with undecodable result bytes   |
//!
//! Anything else is returned with its arguments evaluated. A top-level
//! string is parsed as input source first.
//!
//! Environment knobs:
//!
//! - `MOCK_KERNEL_STDERR`: line written to stderr at startup
//! - `MOCK_KERNEL_STARTUP_DELAY_MS`: delay before the ready marker
//! - `MOCK_KERNEL_NEVER_READY`: never send the ready marker
//! - `MOCK_KERNEL_READY_ONCE`: path of a claim file; only the kernel that
//!   creates it (and writes its pid there) becomes ready
//! - `MOCK_KERNEL_IGNORE_SIGTERM`: ignore SIGTERM
//! - `MOCK_KERNEL_LINGER`: keep running after stdin closes

use kernel_eval_engine::wire::envelope::ready_frame;
use kernel_eval_engine::wire::{
    deserialize, frame_length, serialize, Expr, KernelMessage, ResponseEnvelope,
};
use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Default)]
struct Evaluation {
    messages: Vec<KernelMessage>,
}

fn main() -> ExitCode {
    if let Ok(line) = std::env::var("MOCK_KERNEL_STDERR") {
        eprintln!("{}", line);
    }
    if flag("MOCK_KERNEL_IGNORE_SIGTERM") {
        ignore_sigterm();
    }
    if let Some(ms) = std::env::var("MOCK_KERNEL_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        std::thread::sleep(Duration::from_millis(ms));
    }
    if flag("MOCK_KERNEL_NEVER_READY") || !claim_readiness() {
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }

    match serve() {
        Ok(()) => {
            if flag("MOCK_KERNEL_LINGER") {
                loop {
                    std::thread::sleep(Duration::from_secs(60));
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("mock-kernel: {}", e);
            ExitCode::from(2)
        }
    }
}

fn serve() -> Result<(), String> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    let ready = ready_frame().map_err(|e| e.to_string())?;
    write_all(&mut output, &ready)?;

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        while let Some(len) = frame_length(&buf).map_err(|e| e.to_string())? {
            let frame: Vec<u8> = buf.drain(..len).collect();
            let request = deserialize(&frame).map_err(|e| e.to_string())?;
            respond(&mut output, request)?;
        }

        let n = input.read(&mut chunk).map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn respond(output: &mut impl Write, request: Expr) -> Result<(), String> {
    let mut evaluation = Evaluation::default();
    let request = match request {
        Expr::String(source) => match parse(&source) {
            Ok(expr) => expr,
            Err(e) => {
                evaluation
                    .messages
                    .push(KernelMessage::new("Syntax::sntxf", e));
                Expr::symbol("$Failed")
            }
        },
        other => other,
    };

    match request.head_name() {
        Some("Kill") => {
            eprintln!("mock-kernel: killed on request");
            std::process::exit(1);
        }
        Some("Garbage") => return write_all(output, b"garbage!"),
        Some("BadResult") => {
            let envelope = ResponseEnvelope {
                success: true,
                messages: vec![],
                result: bytes::Bytes::from_static(b"8:\xff"),
            };
            let frame = envelope.encode().map_err(|e| e.to_string())?;
            return write_all(output, &frame);
        }
        _ => {}
    }

    let result = evaluate(&request, &mut evaluation)?;
    let envelope = ResponseEnvelope {
        success: evaluation.messages.is_empty(),
        messages: evaluation.messages,
        result: serialize(&result).map_err(|e| e.to_string())?,
    };
    let frame = envelope.encode().map_err(|e| e.to_string())?;
    write_all(output, &frame)
}

fn evaluate(expr: &Expr, state: &mut Evaluation) -> Result<Expr, String> {
    if expr.is_symbol("$ProcessID") {
        return Ok(Expr::Integer(i64::from(std::process::id())));
    }
    let Some(func) = expr.as_function() else {
        return Ok(expr.clone());
    };

    let head = expr.head_name().unwrap_or_default().to_string();
    if head == "CompoundExpression" {
        let mut last = Expr::symbol("Null");
        for arg in &func.args {
            last = evaluate(arg, state)?;
        }
        return Ok(last);
    }

    let args = func
        .args
        .iter()
        .map(|arg| evaluate(arg, state))
        .collect::<Result<Vec<_>, _>>()?;

    let unevaluated = || Expr::function(func.head.as_ref().clone(), args.clone());
    let result = match (head.as_str(), args.as_slice()) {
        ("Range", [n]) => match n.as_integer() {
            Some(n) => Expr::list(1..=n),
            None => unevaluated(),
        },
        ("Range", [a, b]) => match (a.as_integer(), b.as_integer()) {
            (Some(a), Some(b)) => Expr::list(a..=b),
            _ => unevaluated(),
        },
        ("Plus", _) => plus(&args).unwrap_or_else(unevaluated),
        ("Pause", [seconds]) => {
            match seconds.as_real() {
                Some(s) if s >= 0.0 => {
                    std::thread::sleep(Duration::from_secs_f64(s));
                    Expr::symbol("Null")
                }
                _ => unevaluated(),
            }
        }
        ("FromLetterNumber", [n]) => match n.as_integer() {
            Some(n @ 1..=26) => Expr::string(((b'a' + (n - 1) as u8) as char).to_string()),
            _ => Expr::symbol("Missing"),
        },
        ("Message", [tag, text]) => {
            let tag = tag.as_str().map(str::to_string).unwrap_or_else(|| tag.to_string());
            let text = text.as_str().map(str::to_string).unwrap_or_else(|| text.to_string());
            state.messages.push(KernelMessage::new(tag, text));
            Expr::symbol("Null")
        }
        _ => unevaluated(),
    };
    Ok(result)
}

fn plus(args: &[Expr]) -> Option<Expr> {
    if let Some(ints) = args.iter().map(Expr::as_integer).collect::<Option<Vec<_>>>() {
        return ints
            .into_iter()
            .try_fold(0i64, i64::checked_add)
            .map(Expr::Integer);
    }
    args.iter()
        .map(Expr::as_real)
        .sum::<Option<f64>>()
        .map(Expr::Real)
}

fn write_all(output: &mut impl Write, bytes: &[u8]) -> Result<(), String> {
    output
        .write_all(bytes)
        .and_then(|()| output.flush())
        .map_err(|e| e.to_string())
}

/// False when another kernel already holds the claim file
fn claim_readiness() -> bool {
    let Ok(path) = std::env::var("MOCK_KERNEL_READY_ONCE") else {
        return true;
    };
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(mut file) => {
            if let Err(e) = write!(file, "{}", std::process::id()) {
                eprintln!("mock-kernel: cannot write {}: {}", path, e);
            }
            true
        }
        Err(_) => false,
    }
}

fn flag(name: &str) -> bool {
    std::env::var(name).map(|v| !v.is_empty() && v != "0").unwrap_or(false)
}

fn ignore_sigterm() {
    use nix::sys::signal::{signal, SigHandler, Signal};

    // SAFETY: installs the ignore disposition before any threads exist
    if let Err(e) = unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) } {
        eprintln!("mock-kernel: cannot ignore SIGTERM: {}", e);
    }
}

// Input source parsing: numbers, strings, symbols, f[args], {lists}, a; b

fn parse(source: &str) -> Result<Expr, String> {
    let mut parser = Parser {
        chars: source.chars().collect(),
        pos: 0,
    };
    let expr = parser.compound()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(format!("unexpected input at {}: {:?}", parser.pos, source));
    }
    Ok(expr)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn compound(&mut self) -> Result<Expr, String> {
        let mut parts = vec![self.expr()?];
        while self.eat(';') {
            parts.push(self.expr()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::apply("CompoundExpression", parts)
        })
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut expr = self.atom()?;
        while self.eat('[') {
            let args = self.sequence(']')?;
            expr = Expr::function(expr, args);
        }
        Ok(expr)
    }

    fn sequence(&mut self, close: char) -> Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.compound()?);
            if self.eat(close) {
                return Ok(items);
            }
            if !self.eat(',') {
                return Err(format!("expected ',' or '{}' at {}", close, self.pos));
            }
        }
    }

    fn atom(&mut self) -> Result<Expr, String> {
        self.skip_ws();
        match self.peek() {
            Some('{') => {
                self.pos += 1;
                Ok(Expr::list(self.sequence('}')?))
            }
            Some('"') => self.string(),
            Some(c) if c.is_ascii_digit() || c == '.' || c == '-' => self.number(),
            Some(c) if c.is_alphabetic() || c == '$' => Ok(self.symbol()),
            Some(c) => Err(format!("unexpected {:?} at {}", c, self.pos)),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn string(&mut self) -> Result<Expr, String> {
        self.pos += 1;
        let mut text = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                '"' => return Ok(Expr::string(text)),
                '\\' => {
                    let escaped = self.peek().ok_or("unterminated string")?;
                    self.pos += 1;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                other => text.push(other),
            }
        }
        Err("unterminated string".to_string())
    }

    fn number(&mut self) -> Result<Expr, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if text.contains('.') {
            text.parse::<f64>()
                .map(Expr::Real)
                .map_err(|e| format!("bad real {:?}: {}", text, e))
        } else {
            match text.parse::<i64>() {
                Ok(n) => Ok(Expr::Integer(n)),
                Err(_) if text.len() > 1 => Ok(Expr::BigInteger(text)),
                Err(e) => Err(format!("bad integer {:?}: {}", text, e)),
            }
        }
    }

    fn symbol(&mut self) -> Expr {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '$' || c == '`') {
            self.pos += 1;
        }
        Expr::symbol(self.chars[start..self.pos].iter().collect::<String>())
    }
}
