use crate::{PageSpan, mmap};

#[test]
fn test_regular_span_rounds_up_to_pages() {
    let page = mmap::page_size();
    let span = PageSpan::allocate(page * 3 + 100).expect("allocate");
    assert_eq!(span.capacity(), page * 4);
    assert!(!span.is_large());
    assert!((span.as_ptr().as_ptr() as usize).is_multiple_of(page));
}

#[test]
fn test_zero_size_maps_one_page() {
    let span = PageSpan::allocate(0).expect("allocate");
    assert_eq!(span.capacity(), mmap::page_size());
}

#[test]
fn test_span_is_zeroed_and_writable() {
    let mut span = PageSpan::allocate(10_000).expect("allocate");
    assert!(span.as_bytes().iter().all(|&b| b == 0));
    span.as_bytes_mut()[9_999] = 7;
    assert_eq!(span.as_bytes()[9_999], 7);
}

#[test]
fn test_into_raw_from_raw() {
    let span = PageSpan::allocate(4096).expect("allocate");
    let (ptr, capacity, large) = span.into_raw();
    assert!(!large);
    let span = unsafe { PageSpan::from_raw(ptr, capacity, large) };
    assert_eq!(span.as_ptr(), ptr);
    assert_eq!(span.capacity(), capacity);
}

#[test]
fn test_from_raw_keeps_large_page_flag() {
    let span = PageSpan::allocate_with_fallback(1).expect("allocate");
    let was_large = span.is_large();
    let (ptr, capacity, large) = span.into_raw();
    assert_eq!(large, was_large);
    let span = unsafe { PageSpan::from_raw(ptr, capacity, large) };
    assert_eq!(span.is_large(), was_large);
}

#[test]
fn test_fallback_always_succeeds() {
    let span = PageSpan::allocate_with_fallback(1).expect("allocate");
    assert!(span.capacity() >= mmap::page_size());
}

#[test]
fn test_page_sizes_are_powers_of_two() {
    assert!(PageSpan::page_size().is_power_of_two());
    assert!(PageSpan::large_page_size().is_power_of_two());
}
