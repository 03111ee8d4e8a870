/// Remaps a batch block from item-major `[rows, cols]` to feature-major
/// `[cols, rows]`, treating each entry as `elem_size` bytes, so that one
/// feature across the whole batch is contiguous for the device.
///
/// `scratch` is reused across calls to avoid a per-batch allocation.
pub fn transpose(buf: &mut [u8], rows: usize, cols: usize, elem_size: usize, scratch: &mut Vec<u8>) {
    assert_eq!(buf.len(), rows * cols * elem_size);

    if rows <= 1 || cols <= 1 {
        return;
    }

    scratch.clear();
    scratch.extend_from_slice(buf);

    for row in 0..rows {
        for col in 0..cols {
            let src = (row * cols + col) * elem_size;
            let dst = (col * rows + row) * elem_size;
            buf[dst..dst + elem_size].copy_from_slice(&scratch[src..src + elem_size]);
        }
    }
}
