//! `#[foreign]` on a generic type.

use wren::foreign;

struct Wrapper<T>(T);

#[foreign]
impl<T> Wrapper<T> {
    pub fn ready(&self) -> bool {
        true
    }
}

fn main() {
    let wrapper = Wrapper(1u8);
    let _ = wrapper.0;
}
