//! Unknown `#[foreign(...)]` argument.

use wren::foreign;

struct Widget;

#[foreign(rename = "Gadget")]
impl Widget {
    pub fn new() -> Self {
        Widget
    }
}

fn main() {
    let _ = Widget;
}
