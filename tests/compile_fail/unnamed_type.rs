//! `#[foreign]` on a type with no name to use for the class.

use wren::foreign;

struct Widget;

#[foreign]
impl (Widget, u8) {
    pub fn size(&self) -> i32 {
        2
    }
}

fn main() {
    let _ = Widget;
}
