// Production `Browser` adapters.

mod browserless;

pub use browserless::{BrowserlessBrowser, RenderOptions};
