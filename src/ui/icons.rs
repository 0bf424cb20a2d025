//! Shared UI icons with plain-text fallbacks.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("\u{2705} ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("\u{274C} ", "[ERR] ");
pub static NEXT: Emoji<'_, '_> = Emoji("\u{1F501} ", "[..] ");
pub static SKIP: Emoji<'_, '_> = Emoji("\u{23ED}\u{FE0F}  ", "[SKIP] ");
pub static STOP: Emoji<'_, '_> = Emoji("\u{1F6D1} ", "[STOP] ");
pub static SPARKLE: Emoji<'_, '_> = Emoji("\u{2728} ", "* ");
