//! Unknown `#[wren(...)]` argument.

use wren::foreign;

struct Widget;

#[foreign]
impl Widget {
    pub fn new() -> Self {
        Widget
    }

    #[wren(skip)]
    pub fn size(&self) -> i32 {
        1
    }
}

fn main() {
    let _ = Widget;
}
