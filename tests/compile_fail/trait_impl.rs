//! `#[foreign]` on a trait impl.

use wren::foreign;

struct Widget;

#[foreign]
impl Clone for Widget {
    fn clone(&self) -> Self {
        Widget
    }
}

fn main() {
    let _ = Widget;
}
