/// Number of block sizes in [`DEFAULT_SIZE_CLASSES`].
pub const NUM_DEFAULT_CLASSES: usize = 35;

/// Primary block sizes, header included: 32, 48, 64, then four classes per
/// doubling up to 16 KiB.
///
/// 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512,
/// 640, 768, 896, 1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096,
/// 5120, 6144, 7168, 8192, 10240, 12288, 14336, 16384
pub static DEFAULT_SIZE_CLASSES: [usize; NUM_DEFAULT_CLASSES] = {
    let mut table = [0usize; NUM_DEFAULT_CLASSES];
    let mut idx = 0;
    let mut size = 16;
    while size < 64 {
        size += 16;
        table[idx] = size;
        idx += 1;
    }
    while idx < NUM_DEFAULT_CLASSES {
        let step = size / 4;
        let mut j = 0;
        while j < 4 {
            size += step;
            table[idx] = size;
            idx += 1;
            j += 1;
        }
    }
    table
};

/// Index of the smallest class that holds `needed` bytes.
#[inline]
pub fn class_for(classes: &[usize], needed: usize) -> Option<usize> {
    let idx = classes.partition_point(|&block| block < needed);
    (idx < classes.len()).then_some(idx)
}
