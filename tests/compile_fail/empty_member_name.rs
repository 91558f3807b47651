//! Empty `#[wren(name = "")]`.

use wren::foreign;

struct Widget;

#[foreign]
impl Widget {
    pub fn new() -> Self {
        Widget
    }

    #[wren(name = "")]
    pub fn size(&self) -> i32 {
        1
    }
}

fn main() {
    let _ = Widget;
}
