//! Console capability used by the trap routines and the keyboard registers.
//!
//! The machine only talks to [`Console`]. [`TerminalConsole`] drives the real
//! terminal through crossterm; [`BufferedConsole`] keeps everything in memory.

use std::collections::VecDeque;
use std::io::{self, IsTerminal, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::machine::CancelToken;

pub trait Console {
    fn enable_raw_mode(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn disable_raw_mode(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Wait up to `timeout` for a pending keystroke.
    fn poll_key(&mut self, timeout: Duration) -> io::Result<Option<u8>>;

    /// Block until a keystroke is available. No echo.
    fn read_key(&mut self) -> io::Result<u8>;

    fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    fn write_str(&mut self, text: &str) -> io::Result<()> {
        text.bytes().try_for_each(|b| self.write_byte(b))
    }

    /// Drain host events without blocking. An interrupt request surfaces as an
    /// [`io::ErrorKind::Interrupted`] error; other keys stay queued for later reads.
    fn poll_interrupt(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory console: scripted input, captured output.
#[derive(Debug, Default, Clone)]
pub struct BufferedConsole {
    input: VecDeque<u8>,
    output: Vec<u8>,
    raw_mode: bool,
}

impl BufferedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(input: impl AsRef<[u8]>) -> Self {
        let mut console = Self::new();
        console.push_input(input);
        console
    }

    pub fn push_input(&mut self, input: impl AsRef<[u8]>) {
        self.input.extend(input.as_ref().iter().copied());
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn is_raw_mode(&self) -> bool {
        self.raw_mode
    }
}

impl Console for BufferedConsole {
    fn enable_raw_mode(&mut self) -> io::Result<()> {
        self.raw_mode = true;
        Ok(())
    }

    fn disable_raw_mode(&mut self) -> io::Result<()> {
        self.raw_mode = false;
        Ok(())
    }

    fn poll_key(&mut self, _timeout: Duration) -> io::Result<Option<u8>> {
        Ok(self.input.pop_front())
    }

    fn read_key(&mut self) -> io::Result<u8> {
        self.input
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "console input exhausted"))
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.output.push(byte);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Process terminal. Raw mode is entered only when stdin is a TTY; it is always
/// restored on drop.
///
/// Non-TTY stdin is drained by a background reader thread so keyboard polls stay
/// bounded by their timeout even while the pipe is open and idle.
pub struct TerminalConsole {
    interactive: bool,
    raw: bool,
    cancel: CancelToken,
    pending: VecDeque<u8>,
    piped: Option<Receiver<u8>>,
    out: io::Stdout,
}

impl TerminalConsole {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            interactive: io::stdin().is_terminal(),
            raw: false,
            cancel,
            pending: VecDeque::new(),
            piped: None,
            out: io::stdout(),
        }
    }

    fn interrupted(&self) -> io::Error {
        self.cancel.cancel();
        io::Error::new(io::ErrorKind::Interrupted, "interrupt requested")
    }

    fn next_key(&mut self, timeout: Option<Duration>) -> io::Result<Option<u8>> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }
        loop {
            if let Some(timeout) = timeout {
                if !event::poll(timeout)? {
                    return Ok(None);
                }
            }
            if let Event::Key(key) = event::read()? {
                if is_ctrl_c(&key) {
                    return Err(self.interrupted());
                }
                if let Some(byte) = key_to_byte(&key) {
                    return Ok(Some(byte));
                }
            }
        }
    }

    fn piped_input(&mut self) -> &Receiver<u8> {
        self.piped.get_or_insert_with(|| spawn_reader(io::stdin()))
    }

    /// `None` once stdin has reached end of input.
    fn next_piped_byte(&mut self, timeout: Option<Duration>) -> Option<u8> {
        let input = self.piped_input();
        match timeout {
            None => input.recv().ok(),
            Some(Duration::ZERO) => match input.try_recv() {
                Ok(byte) => Some(byte),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            },
            Some(timeout) => match input.recv_timeout(timeout) {
                Ok(byte) => Some(byte),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
        }
    }
}

/// Forward bytes from `source` over a channel. The sender drops at end of input
/// or on a read error, which disconnects the receiver.
fn spawn_reader<R: Read + Send + 'static>(source: R) -> Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for byte in source.bytes() {
            let Ok(byte) = byte else { break };
            if tx.send(byte).is_err() {
                break;
            }
        }
    });
    rx
}

fn is_ctrl_c(key: &KeyEvent) -> bool {
    key.kind == KeyEventKind::Press
        && key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char('c') | KeyCode::Char('C'))
}

fn key_to_byte(key: &KeyEvent) -> Option<u8> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char(ch) if ch.is_ascii() => {
            let byte = ch as u8;
            if key.modifiers.contains(KeyModifiers::CONTROL) && byte.is_ascii_alphabetic() {
                Some(byte.to_ascii_uppercase() & 0x1F)
            } else {
                Some(byte)
            }
        }
        KeyCode::Enter => Some(b'\n'),
        KeyCode::Tab => Some(b'\t'),
        KeyCode::Backspace => Some(0x08),
        KeyCode::Esc => Some(0x1B),
        _ => None,
    }
}

impl Console for TerminalConsole {
    fn enable_raw_mode(&mut self) -> io::Result<()> {
        if self.interactive && !self.raw {
            crossterm::terminal::enable_raw_mode()?;
            self.raw = true;
        }
        Ok(())
    }

    fn disable_raw_mode(&mut self) -> io::Result<()> {
        if self.raw {
            self.raw = false;
            crossterm::terminal::disable_raw_mode()?;
        }
        Ok(())
    }

    fn poll_key(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        if self.interactive {
            self.next_key(Some(timeout))
        } else {
            Ok(self.next_piped_byte(Some(timeout)))
        }
    }

    fn read_key(&mut self) -> io::Result<u8> {
        let key = if self.interactive {
            self.next_key(None)?
        } else {
            self.next_piped_byte(None)
        };
        key.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"))
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        if self.raw && byte == b'\n' {
            self.out.write_all(b"\r\n")
        } else {
            self.out.write_all(&[byte])
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    fn poll_interrupt(&mut self) -> io::Result<()> {
        if !self.interactive {
            return Ok(());
        }
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if is_ctrl_c(&key) {
                    return Err(self.interrupted());
                }
                self.pending.extend(key_to_byte(&key));
            }
        }
        Ok(())
    }
}

impl Drop for TerminalConsole {
    fn drop(&mut self) {
        let _ = self.out.flush();
        let _ = self.disable_raw_mode();
    }
}
