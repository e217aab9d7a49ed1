//! Key mapping for terminal input
//!
//! Turns console key events into bytes for the serial line, or into local
//! commands bound to function keys.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

/// What a key press asks for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyAction {
    /// Transmit these bytes
    Send(Vec<u8>),
    /// F2: open or close the port
    ToggleConnection,
    /// F3: switch between UNIX and DOS line endings
    ToggleCrLf,
    /// F4: blank the local screen
    ClearScreen,
    /// F5: write the screen text to a file
    SaveScreen,
    /// F10
    Quit,
    None,
}

/// Key mapper for converting key events to actions
pub struct KeyMapper;

impl KeyMapper {
    pub fn map(event: &KeyEvent) -> KeyAction {
        if event.kind == KeyEventKind::Release {
            return KeyAction::None;
        }
        let mods = Modifiers::from(event.modifiers);

        match event.code {
            KeyCode::F(2) => KeyAction::ToggleConnection,
            KeyCode::F(3) => KeyAction::ToggleCrLf,
            KeyCode::F(4) => KeyAction::ClearScreen,
            KeyCode::F(5) => KeyAction::SaveScreen,
            KeyCode::F(10) => KeyAction::Quit,

            KeyCode::Char(ch) => match Self::map_char(ch, mods) {
                Some(bytes) => KeyAction::Send(bytes),
                None => KeyAction::None,
            },
            KeyCode::Enter => KeyAction::Send(vec![0x0D]),
            KeyCode::Backspace => KeyAction::Send(vec![0x08]),
            KeyCode::Tab => KeyAction::Send(vec![0x09]),
            KeyCode::Esc => KeyAction::Send(vec![0x1B]),
            KeyCode::Delete => KeyAction::Send(vec![0x7F]),

            _ => KeyAction::None,
        }
    }

    /// Map a character with modifiers. Characters outside Latin-1 cannot be sent.
    fn map_char(ch: char, mods: Modifiers) -> Option<Vec<u8>> {
        if mods.contains(Modifiers::CTRL) {
            let code = match ch {
                'a'..='z' => ch as u8 - b'a' + 1,
                'A'..='Z' => ch as u8 - b'A' + 1,
                '@' | ' ' => 0x00,
                '[' => 0x1B,
                '\\' => 0x1C,
                ']' => 0x1D,
                '^' => 0x1E,
                '_' => 0x1F,
                _ => return None,
            };
            return Some(if mods.contains(Modifiers::ALT) {
                vec![0x1B, code]
            } else {
                vec![code]
            });
        }

        let byte = u8::try_from(u32::from(ch)).ok()?;
        if mods.contains(Modifiers::ALT) {
            Some(vec![0x1B, byte])
        } else {
            Some(vec![byte])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_event(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, mods)
    }

    #[test]
    fn test_char_keys() {
        let event = key_event(KeyCode::Char('a'), KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&event), KeyAction::Send(b"a".to_vec()));

        let event = key_event(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(KeyMapper::map(&event), KeyAction::Send(vec![0x03]));

        let event = key_event(KeyCode::Char('Z'), KeyModifiers::CONTROL | KeyModifiers::SHIFT);
        assert_eq!(KeyMapper::map(&event), KeyAction::Send(vec![0x1A]));

        let event = key_event(KeyCode::Char('x'), KeyModifiers::ALT);
        assert_eq!(KeyMapper::map(&event), KeyAction::Send(vec![0x1B, b'x']));
    }

    #[test]
    fn test_latin1_only() {
        let event = key_event(KeyCode::Char('é'), KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&event), KeyAction::Send(vec![0xE9]));

        let event = key_event(KeyCode::Char('€'), KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&event), KeyAction::None);
    }

    #[test]
    fn test_control_keys() {
        let cases = [
            (KeyCode::Enter, 0x0D),
            (KeyCode::Backspace, 0x08),
            (KeyCode::Tab, 0x09),
            (KeyCode::Esc, 0x1B),
            (KeyCode::Delete, 0x7F),
        ];
        for (code, byte) in cases {
            let event = key_event(code, KeyModifiers::NONE);
            assert_eq!(KeyMapper::map(&event), KeyAction::Send(vec![byte]));
        }
    }

    #[test]
    fn test_function_keys() {
        let map = |n| KeyMapper::map(&key_event(KeyCode::F(n), KeyModifiers::NONE));
        assert_eq!(map(2), KeyAction::ToggleConnection);
        assert_eq!(map(3), KeyAction::ToggleCrLf);
        assert_eq!(map(4), KeyAction::ClearScreen);
        assert_eq!(map(5), KeyAction::SaveScreen);
        assert_eq!(map(10), KeyAction::Quit);
        assert_eq!(map(6), KeyAction::None);
    }

    #[test]
    fn test_release_ignored() {
        let mut event = key_event(KeyCode::Char('a'), KeyModifiers::NONE);
        event.kind = KeyEventKind::Release;
        assert_eq!(KeyMapper::map(&event), KeyAction::None);
    }
}
