//! Demo live views served by `lumen serve`.
//!
//! | Route          | View             | Shows                                   |
//! |----------------|------------------|-----------------------------------------|
//! | `/`            | `CounterView`    | event table, params, pub/sub            |
//! | `/streams`     | `StreamView`     | stream inserts, deletes and resets      |
//! | `/components`  | `ComponentsView` | stateful components, slots, send_parent |
//! | `/clock`       | `ClockView`      | scheduled info, page title              |
//! | `/rooms/{id}`  | `StreamView`     | path params                             |

mod clock;
mod components;
mod counter;
mod streams;

pub use clock::ClockView;
pub use components::{Card, ComponentsView};
pub use counter::CounterView;
pub use streams::StreamView;

use crate::view::LiveRoutes;

pub fn routes() -> LiveRoutes {
    LiveRoutes::new()
        .add("/", || Box::new(CounterView::default()))
        .add("/streams", || Box::new(StreamView::default()))
        .add("/rooms/{id}", || Box::new(StreamView::default()))
        .add("/components", || Box::new(ComponentsView::default()))
        .add("/clock", || Box::new(ClockView::default()))
}
