use std::ptr::NonNull;

use fixpool::{FixedPool, PoolError};

fn log_alloc(pool: &FixedPool<u64, 4096>, addr: NonNull<u64>) -> Result<(), PoolError> {
    println!(
        "Received {addr:?} (block {:?}, {} chunks left, {} blocks)",
        pool.block_address(Some(addr))?,
        pool.available_chunks_in_block(addr)?,
        pool.block_count()
    );
    Ok(())
}

fn main() -> Result<(), PoolError> {
    let mut pool = FixedPool::<u64, 4096>::new(1024)?;
    println!("{pool:?}");

    let mut values = Vec::new();
    for i in 0..6 {
        let addr = pool.allocate(i)?;
        log_alloc(&pool, addr)?;
        values.push(Some(addr));
    }

    println!("Releasing the second value");
    let reused = values[1];
    unsafe { pool.release(&mut values[1])? };

    let addr = pool.allocate(100)?;
    println!("Should be the released address {:?}: {addr:?}", reused);
    values.push(Some(addr));

    for handle in values.iter_mut() {
        unsafe { pool.release(handle)? };
    }
    println!("{pool:?}");

    Ok(())
}
