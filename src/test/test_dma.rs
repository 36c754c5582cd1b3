use crate::dma::{DmaPool, DmaResource};
use crate::tasks::{IoOperation, OperationPhase};
use crate::test::*;
use nix::errno::Errno;

#[test]
fn test_dma_pool_invalid() {
    assert_eq!(DmaPool::new(1, 1024, 0).err(), Some(Errno::EINVAL));
    assert_eq!(DmaPool::new(1, 256, 512).err(), Some(Errno::EINVAL));
    assert_eq!(DmaPool::new(1, 1000, 512).err(), Some(Errno::EINVAL));
    let pool = DmaPool::new(3, 2048, 512).unwrap();
    assert_eq!(pool.buffer_count(), 3);
    assert_eq!(pool.free_count(), 3);
    assert_eq!(pool.buffer_size(), 2048);
}

#[test]
fn test_dma_aligned_read() {
    let pool = dma_pool(4, 4);
    let request = read_request(1, 4096, 8 * BLOCK as usize);
    let mut op = IoOperation::new(0);
    pool.translate_next(&request, &mut op, 1 << 20).unwrap();
    assert_eq!(op.phase(), OperationPhase::Read);
    assert_eq!((op.offset(), op.length()), (4096, 2048));
    assert_eq!((op.original_offset(), op.original_length()), (4096, 2048));
    assert_eq!(request.remaining_bytes(), 2048);
    assert_eq!(request.current_offset(), 6144);
    assert_eq!(request.pending_operations(), 1);
    assert_eq!(pool.free_count(), 3);
}

#[test]
fn test_dma_respects_max_length() {
    let pool = dma_pool(4, 4);
    let request = read_request(1, 0, 8 * BLOCK as usize);
    let mut op = IoOperation::new(0);
    pool.translate_next(&request, &mut op, 1024).unwrap();
    assert_eq!(op.length(), 1024);
    assert_eq!(request.remaining_bytes(), 3072);
}

#[test]
fn test_dma_aligned_write_fills_bounce() {
    let pool = dma_pool(1, 4);
    let request = write_request(1, 0, 1024, 3);
    let mut op = IoOperation::new(0);
    pool.translate_next(&request, &mut op, 1 << 20).unwrap();
    assert_eq!(op.phase(), OperationPhase::Write);
    assert!(op.is_write());
    let expected = request_data(&request);
    op.with_transfer_buffer(|b| assert_eq!(&b[..], &expected[..]));
}

#[test]
fn test_dma_unaligned_write_reads_first() {
    let pool = dma_pool(2, 4);
    let request = write_request(1, 300, 700, 0);
    let mut op = IoOperation::new(0);
    pool.translate_next(&request, &mut op, 1 << 20).unwrap();
    assert_eq!(op.phase(), OperationPhase::ReadBeforeWrite);
    assert!(!op.is_write());
    assert_eq!((op.offset(), op.length()), (0, 1024));
    assert_eq!((op.original_offset(), op.original_length()), (300, 700));
    assert_eq!(request.remaining_bytes(), 0);
}

#[test]
fn test_dma_unaligned_start_split() {
    // The first chunk ends on the buffer boundary, the second starts aligned.
    let pool = dma_pool(2, 4);
    let request = read_request(1, 100, 3000);
    let mut op1 = IoOperation::new(0);
    pool.translate_next(&request, &mut op1, 1 << 20).unwrap();
    assert_eq!((op1.offset(), op1.length()), (0, 2048));
    assert_eq!((op1.original_offset(), op1.original_length()), (100, 1948));
    let mut op2 = IoOperation::new(1);
    pool.translate_next(&request, &mut op2, 1 << 20).unwrap();
    assert_eq!((op2.offset(), op2.length()), (2048, 1536));
    assert_eq!((op2.original_offset(), op2.original_length()), (2048, 1052));
    assert_eq!(request.remaining_bytes(), 0);
}

#[test]
fn test_dma_exhausted_is_busy() {
    let pool = dma_pool(1, 4);
    let request = read_request(1, 0, 16 * BLOCK as usize);
    let mut op1 = IoOperation::new(0);
    pool.translate_next(&request, &mut op1, 1 << 20).unwrap();
    let remaining = request.remaining_bytes();

    let mut op2 = IoOperation::new(1);
    assert_eq!(pool.translate_next(&request, &mut op2, 1 << 20), Err(Errno::EBUSY));
    assert_eq!(request.remaining_bytes(), remaining);
    assert!(op2.parent().is_none());
    assert_eq!(request.pending_operations(), 1);

    let buffer = op1.recycle().unwrap();
    pool.recycle_buffer(buffer);
    assert_eq!(pool.free_count(), 1);
    pool.translate_next(&request, &mut op2, 1 << 20).unwrap();
    assert_eq!(op2.offset(), 2048);
}

#[test]
fn test_dma_nothing_left() {
    let pool = dma_pool(1, 4);
    let request = read_request(1, 0, 512);
    request.advance(512);
    let mut op = IoOperation::new(0);
    assert_eq!(pool.translate_next(&request, &mut op, 1 << 20), Err(Errno::EINVAL));
    assert_eq!(pool.free_count(), 1);
}
