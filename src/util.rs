pub fn align_down(x: usize, alignment: usize) -> usize {
    x & !(alignment - 1)
}

pub fn align_up(x: usize, alignment: usize) -> usize {
    x.wrapping_add(alignment.wrapping_sub(1)) & !(alignment - 1)
}
