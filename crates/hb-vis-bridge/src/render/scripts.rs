//! JavaScript submitted to the browser driver as opaque blobs. The core
//! never executes these itself — [`crate::driver::Page`] does, via
//! `set_init_script`/`evaluate`/`evaluate_async`.

/// Installed once per page via `Page::set_init_script`, so it re-runs on
/// every document load (including reloads and cache-busted navigations).
///
/// - Paints the document root and body black as early as possible, on both
///   document-element creation and `DOMContentLoaded`, so a white flash
///   during navigation never reaches the matrix.
/// - Injects a stylesheet hiding the text caret and collapsing animations/
///   transitions to zero duration, since `Emulation.setEmulatedMedia`'s
///   `prefers-reduced-motion` feature only *asks* pages to respect the
///   media query — it doesn't force it for pages that don't.
/// - Installs `window.__hb = {dirty, dirtyTs, seq}` plus a mutation
///   observer and resize/scroll listeners that mark it dirty.
pub const INIT_SCRIPT: &str = r#"
(function () {
    function blacken() {
        try {
            if (document.documentElement) {
                document.documentElement.style.backgroundColor = '#000';
            }
            if (document.body) {
                document.body.style.backgroundColor = '#000';
            }
        } catch (e) {}
    }
    blacken();
    document.addEventListener('DOMContentLoaded', blacken);

    function injectStyle() {
        try {
            if (document.getElementById('__hb_no_anim')) return;
            var style = document.createElement('style');
            style.id = '__hb_no_anim';
            style.textContent =
                '*, *::before, *::after {' +
                '  caret-color: transparent !important;' +
                '  animation-duration: 0s !important;' +
                '  animation-delay: 0s !important;' +
                '  transition-duration: 0s !important;' +
                '  transition-delay: 0s !important;' +
                '}';
            (document.head || document.documentElement).appendChild(style);
        } catch (e) {}
    }
    injectStyle();
    document.addEventListener('DOMContentLoaded', injectStyle);

    window.__hb = { dirty: true, dirtyTs: Date.now(), seq: 0 };

    function markDirty() {
        window.__hb.dirty = true;
        window.__hb.dirtyTs = Date.now();
        window.__hb.seq += 1;
    }

    function installObserver() {
        if (!document.documentElement) {
            requestAnimationFrame(installObserver);
            return;
        }
        var observer = new MutationObserver(markDirty);
        observer.observe(document.documentElement, {
            subtree: true,
            childList: true,
            attributes: true,
            characterData: true,
        });
    }
    installObserver();

    window.addEventListener('resize', markDirty);
    window.addEventListener('scroll', markDirty, true);
})();
"#;

/// Reads and clears `window.__hb.dirty`, returning the prior value.
/// Absence of `__hb` (not yet installed, or page not yet navigated) counts
/// as not dirty.
pub const CONSUME_DIRTY_JS: &str = r#"
(function () {
    if (!window.__hb) return false;
    var was = window.__hb.dirty;
    window.__hb.dirty = false;
    return was;
})()
"#;

/// Two-level nested `requestAnimationFrame` wait, used just before
/// screenshotting to avoid capturing transient DOM states mid-paint.
pub const PAINT_DEBOUNCE_JS: &str = r#"
new Promise(function (resolve) {
    requestAnimationFrame(function () {
        requestAnimationFrame(function () {
            resolve(true);
        });
    });
})
"#;

/// Marks the in-page dirty flag, used right after a reload to guarantee the
/// next iteration captures even if the DOM didn't actually mutate.
pub const MARK_DIRTY_JS: &str = r#"
(function () {
    if (!window.__hb) {
        window.__hb = { dirty: true, dirtyTs: Date.now(), seq: 1 };
        return true;
    }
    window.__hb.dirty = true;
    window.__hb.dirtyTs = Date.now();
    window.__hb.seq += 1;
    return true;
})()
"#;
