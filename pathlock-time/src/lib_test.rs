// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;
use time::macros::datetime;

#[test]
fn unix_timestamp_ms_preserves_sub_second_digits() {
  let t = datetime!(2024-01-15 10:30:00.123 UTC);
  assert_eq!(t.unix_timestamp_ms(), t.unix_timestamp() * 1_000 + 123);
  assert_eq!(from_unix_timestamp_ms(t.unix_timestamp_ms()), t);
}

#[tokio::test]
async fn test_provider_advances_on_sleep() {
  let start = datetime!(2024-01-15 10:30:00 UTC);
  let provider = TestTimeProvider::new(start);
  assert_eq!(provider.now(), start);

  provider.sleep(time::Duration::seconds(5)).await;
  assert_eq!(provider.now(), start + time::Duration::seconds(5));

  provider.advance(time::Duration::milliseconds(250));
  assert_eq!(
    provider.now(),
    start + time::Duration::milliseconds(5_250)
  );
}
