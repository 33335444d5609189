//! Key events, hotkeys and hotkey-list matching.

use crate::{component::ComponentId, message::Message};

/// Modifier bit masks for [`KeyEvent::modifiers`].
///
/// Only the four masks below participate in hotkey matching; anything else
/// (caps lock, num lock, ...) is masked away before lookup.
pub mod modifiers {
    pub const SHIFT: u32 = 1 << 0;
    pub const CONTROL: u32 = 1 << 1;
    pub const ALT: u32 = 1 << 2;
    pub const META: u32 = 1 << 3;

    /// The modifiers a hotkey definition may discriminate on.
    pub const HOTKEY_MASK: u32 = SHIFT | CONTROL | ALT | META;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyState {
    #[default]
    Down,
    Up,
}

/// A single keyboard event as reported by an application.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyEvent {
    pub keycode: u32,
    pub modifiers: u32,
    pub state: KeyState,
    /// Whether the key itself is a modifier key (shift, control, ...).
    pub is_modifier: bool,
}

impl KeyEvent {
    pub fn down(keycode: u32) -> Self {
        Self {
            keycode,
            ..Self::default()
        }
    }

    pub fn up(keycode: u32) -> Self {
        Self {
            keycode,
            state: KeyState::Up,
            ..Self::default()
        }
    }

    pub fn with_modifiers(mut self, modifiers: u32) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn as_modifier_key(mut self) -> Self {
        self.is_modifier = true;
        self
    }
}

/// One hotkey definition: any of `key_events` triggers the associated
/// messages, which are dispatched on behalf of the list's owner.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Hotkey {
    pub key_events: Vec<KeyEvent>,
    pub messages: Vec<Message>,
}

/// A named set of hotkeys registered by one component.
///
/// Each component may register several lists under distinct ids and activate
/// at most one of them per input context.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HotkeyList {
    pub id: u32,
    pub owner: ComponentId,
    pub hotkeys: Vec<Hotkey>,
}

impl HotkeyList {
    /// Matches `current` against this list.
    ///
    /// A key-down matches a down-targeted hotkey with the same keycode and
    /// (masked) modifiers. A key-up is only considered against up-targeted
    /// hotkeys and only if `previous` was a key-down with identical
    /// modifiers and the same keycode, or both events are modifier keys.
    /// This keeps a release-triggered hotkey from firing at the tail of an
    /// unrelated combination.
    pub fn matches(&self, previous: Option<&KeyEvent>, current: &KeyEvent) -> Option<&Hotkey> {
        let current_modifiers = current.modifiers & modifiers::HOTKEY_MASK;

        if current.state == KeyState::Up {
            let previous = previous?;
            if previous.state != KeyState::Down {
                return None;
            }
            if previous.modifiers & modifiers::HOTKEY_MASK != current_modifiers {
                return None;
            }
            if previous.keycode != current.keycode
                && !(previous.is_modifier && current.is_modifier)
            {
                return None;
            }
        }

        self.hotkeys.iter().find(|hotkey| {
            hotkey.key_events.iter().any(|trigger| {
                trigger.keycode != 0
                    && trigger.keycode == current.keycode
                    && trigger.state == current.state
                    && trigger.modifiers & modifiers::HOTKEY_MASK == current_modifiers
            })
        })
    }
}
