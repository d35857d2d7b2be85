//! Echo-free passphrase prompt

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use gridproxy_auth::{DelegationError, PassphraseSource};
use std::io::Write;
use zeroize::Zeroizing;

/// Reads a passphrase from the terminal with echo disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

/// Restores cooked mode when dropped, including on early return
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

enum Key {
    Char(char),
    Backspace,
    Done,
    Abort,
}

fn map_key(event: Event) -> Option<Key> {
    let Event::Key(KeyEvent {
        code,
        modifiers,
        kind,
        ..
    }) = event
    else {
        return None;
    };
    if kind != KeyEventKind::Press {
        return None;
    }
    match code {
        KeyCode::Enter => Some(Key::Done),
        KeyCode::Esc => Some(Key::Abort),
        KeyCode::Backspace => Some(Key::Backspace),
        KeyCode::Char('c') | KeyCode::Char('d') if modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Key::Abort)
        }
        KeyCode::Char(c) => Some(Key::Char(c)),
        _ => None,
    }
}

fn failure(e: impl std::fmt::Display) -> DelegationError {
    DelegationError::PassphraseFailure(e.to_string())
}

impl PassphraseSource for TerminalPrompt {
    fn passphrase(&self, prompt: &str) -> gridproxy_auth::Result<Zeroizing<String>> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{}: ", prompt).map_err(failure)?;
        stderr.flush().map_err(failure)?;

        let mut entered = Zeroizing::new(String::new());
        let outcome = {
            let _guard = RawModeGuard::enable().map_err(failure)?;
            loop {
                match map_key(event::read().map_err(failure)?) {
                    Some(Key::Char(c)) => entered.push(c),
                    Some(Key::Backspace) => {
                        entered.pop();
                    }
                    Some(Key::Done) => break Ok(()),
                    Some(Key::Abort) => break Err(failure("passphrase entry cancelled")),
                    None => {}
                }
            }
        };
        // Raw mode swallowed the newline
        let _ = writeln!(stderr);

        outcome.map(|()| entered)
    }
}
